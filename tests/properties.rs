use plsa::{normalize_columns, CountMatrix, FoldInConfig, Matrix, Plsa, PlsaConfig};
use proptest::prelude::*;

fn count_rows() -> impl Strategy<Value = Vec<Vec<u32>>> {
    (1usize..5, 1usize..6).prop_flat_map(|(docs, words)| {
        prop::collection::vec(prop::collection::vec(0u32..8, words), docs)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn normalized_columns_sum_to_one(
        (rows, cols, data) in (1usize..6, 1usize..5).prop_flat_map(|(r, c)| {
            (Just(r), Just(c), prop::collection::vec(0.0f64..100.0, r * c))
        })
    ) {
        let mut m = Matrix::from_vec(rows, cols, data).unwrap();
        normalize_columns(&mut m);
        for sum in m.column_sums() {
            prop_assert!((sum - 1.0).abs() < 1e-9);
        }
        prop_assert!(m.as_slice().iter().all(|&p| (0.0..=1.0 + 1e-12).contains(&p)));
    }

    #[test]
    fn fit_yields_distributions_and_monotone_trace(rows in count_rows(), k in 1usize..4, seed in any::<u64>()) {
        let counts = CountMatrix::from_counts(rows).unwrap();
        let config = PlsaConfig::new(k)
            .with_max_iterations(40)
            .with_tolerance(0.0)
            .with_seed(seed)
            .with_parallel(false);
        let model = Plsa::new(config).fit(&counts).unwrap();

        prop_assert!((model.topic_prior().iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for sum in model.word_topic().column_sums().into_iter().chain(model.doc_topic().column_sums()) {
            prop_assert!((sum - 1.0).abs() < 1e-9);
        }
        for pair in model.log_likelihood_trace().windows(2) {
            prop_assert!(pair[1] >= pair[0] - 1e-9 * pair[0].abs().max(1.0));
        }
        for d in 0..model.n_docs() {
            prop_assert!((model.document_mixture(d).iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn fold_in_rows_sum_to_one(train in count_rows(), k in 1usize..4, extra in prop::collection::vec(0u32..8, 0..6)) {
        let counts = CountMatrix::from_counts(train).unwrap();
        let model = Plsa::new(PlsaConfig::new(k).with_max_iterations(20).with_parallel(false))
            .fit(&counts)
            .unwrap();

        let mut row = extra;
        row.resize(counts.n_words(), 0);
        let new_docs = CountMatrix::from_counts(vec![row]).unwrap();
        let result = model.fold_in(&new_docs, &FoldInConfig::default()).unwrap();
        prop_assert!((result.mixture(0).iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
