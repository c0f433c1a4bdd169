use std::env;
use std::path::PathBuf;

use plsa::Corpus;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.len() != 5 {
        eprintln!("Usage: {} <input.json> <train.json> <heldout.json> <every_nth>", args[0]);
        eprintln!("Example: split_counts corpus.json train.json heldout.json 10");
        std::process::exit(1);
    }

    let input_path = PathBuf::from(&args[1]);
    let train_path = PathBuf::from(&args[2]);
    let heldout_path = PathBuf::from(&args[3]);
    let every_nth: usize = args[4]
        .parse()
        .map_err(|_| "every_nth must be a positive integer")?;

    if every_nth == 0 {
        eprintln!("every_nth must be at least 1");
        std::process::exit(1);
    }

    let corpus = Corpus::from_json_file(&input_path)?;
    println!(
        "Holding out every {}th of {} documents from {}",
        every_nth,
        corpus.counts.n_docs(),
        input_path.display()
    );

    let (heldout, heldout_rows, train, train_rows) = corpus.counts.split_every(every_nth)?;
    let labels_for = |rows: &[usize]| rows.iter().map(|&d| corpus.label(d)).collect::<Vec<_>>();

    let heldout = Corpus::new(corpus.vocabulary.clone(), heldout)?.with_labels(labels_for(&heldout_rows))?;
    let train = Corpus::new(corpus.vocabulary.clone(), train)?.with_labels(labels_for(&train_rows))?;

    train.to_json_file(&train_path)?;
    heldout.to_json_file(&heldout_path)?;

    println!("✅ {} training documents written to {}", train_rows.len(), train_path.display());
    println!("✅ {} held-out documents written to {}", heldout_rows.len(), heldout_path.display());

    Ok(())
}
