use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plsa::{ConvergenceCriterion, Corpus, FoldInConfig, ModelVariant, Plsa, PlsaConfig, PlsaModel};

#[derive(Parser, Debug)]
#[command(version, about = "Probabilistic latent semantic analysis on document-term counts", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit a model to a corpus JSON file ({"vocabulary": [...], "counts": [[...]]})
    Fit(FitArgs),
    /// Project new documents into a saved model's topic space
    FoldIn {
        model: PathBuf,
        corpus: PathBuf,
        #[clap(long, default_value_t = 100)]
        max_iter: usize,
        #[clap(long, default_value_t = 1e-6)]
        tolerance: f64,
    },
    /// Print the top words of a saved model
    Topics {
        model: PathBuf,
        #[clap(short, long, default_value_t = 10)]
        top: usize,
    },
}

#[derive(clap::Args, Debug)]
struct FitArgs {
    corpus: PathBuf,
    #[clap(long, help = "JSON config file; flags given here override its values")]
    config: Option<PathBuf>,
    #[clap(short = 'k', long)]
    topics: Option<usize>,
    #[clap(long)]
    restarts: Option<usize>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long)]
    max_iter: Option<usize>,
    #[clap(long)]
    tolerance: Option<f64>,
    #[clap(long)]
    warmup: Option<usize>,
    #[clap(long, help = "Measure convergence as absolute rather than relative likelihood change")]
    absolute: bool,
    #[clap(long, help = "Weight counts by inverse document frequency before fitting")]
    tf_idf: bool,
    #[clap(long, help = "Fit P(d,w) = P(w) sum_z P(d|z) P(z|w) instead of the joint aspect model")]
    conditional: bool,
    #[clap(long, help = "Run restarts one after another instead of in parallel")]
    sequential: bool,
    #[clap(long, help = "Wall-clock budget in seconds")]
    time_limit: Option<f64>,
    #[clap(short, long, help = "Where to write the fitted model")]
    output: Option<PathBuf>,
    #[clap(short, long, default_value_t = 10)]
    top: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let outcome = match args.command {
        Command::Fit(fit_args) => run_fit(fit_args),
        Command::FoldIn {
            model,
            corpus,
            max_iter,
            tolerance,
        } => run_fold_in(&model, &corpus, max_iter, tolerance),
        Command::Topics { model, top } => PlsaModel::load(&model)
            .with_context(|| format!("loading model {}", model.display()))
            .map(|model| print_topics(&model, top)),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn build_config(args: &FitArgs) -> Result<PlsaConfig> {
    let mut config = match &args.config {
        Some(path) => PlsaConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PlsaConfig::default(),
    };
    if let Some(topics) = args.topics {
        config.n_topics = topics;
    }
    if let Some(restarts) = args.restarts {
        config.n_restarts = restarts;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_iter) = args.max_iter {
        config.max_iterations = max_iter;
    }
    if let Some(tolerance) = args.tolerance {
        config.tolerance = tolerance;
    }
    if let Some(warmup) = args.warmup {
        config.warmup = warmup;
    }
    if args.absolute {
        config.criterion = ConvergenceCriterion::Absolute;
    }
    if args.tf_idf {
        config.tf_idf = true;
    }
    if args.conditional {
        config.variant = ModelVariant::Conditional;
    }
    if args.sequential {
        config.parallel = false;
    }
    if args.time_limit.is_some() {
        config.time_limit_secs = args.time_limit;
    }
    Ok(config)
}

fn run_fit(args: FitArgs) -> Result<()> {
    let config = build_config(&args)?;
    let corpus = Corpus::from_json_file(&args.corpus)
        .with_context(|| format!("reading corpus {}", args.corpus.display()))?;
    println!("Corpus: {} documents, {} words", corpus.counts.n_docs(), corpus.counts.n_words());
    if config.tf_idf {
        println!("Weighting counts by inverse document frequency");
    }

    let model = Plsa::new(config).fit_corpus(&corpus)?;

    println!("\n{model}\n");
    println!("📊 Restarts:");
    for restart in model.restarts() {
        let marker = if restart.index == model.best_restart() { "✓" } else { " " };
        match (&restart.status, restart.log_likelihood) {
            (Some(status), Some(ll)) => println!(
                "   {} #{:<3} seed {:<6} {:<10} {:>5} iterations  log-likelihood {:.4}",
                marker, restart.index, restart.seed, status, restart.iterations, ll
            ),
            _ => println!(
                "   {} #{:<3} seed {:<6} failed: {}",
                marker,
                restart.index,
                restart.seed,
                restart.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!();
    print_topics(&model, args.top);

    println!("\n🎯 Primary topic per document:");
    for d in 0..model.n_docs() {
        let mixture = model.document_mixture(d);
        let topic = model.primary_topic(d);
        println!("   {:<20} topic {:<3} ({:.3})", corpus.label(d), topic, mixture[topic]);
    }

    if let Some(output) = &args.output {
        model
            .save(output)
            .with_context(|| format!("writing model {}", output.display()))?;
        println!("\n✅ Model written to {}", output.display());
    }
    Ok(())
}

fn run_fold_in(model_path: &Path, corpus_path: &Path, max_iter: usize, tolerance: f64) -> Result<()> {
    let model = PlsaModel::load(model_path)
        .with_context(|| format!("loading model {}", model_path.display()))?;
    let corpus = Corpus::from_json_file(corpus_path)
        .with_context(|| format!("reading corpus {}", corpus_path.display()))?;

    let config = FoldInConfig::default()
        .with_max_iterations(max_iter)
        .with_tolerance(tolerance);
    let result = model.fold_in_corpus(&corpus, &config)?;

    println!(
        "Folded {} documents into {} topics: {} after {} iterations",
        result.n_docs(),
        model.n_topics(),
        result.status,
        result.iterations
    );
    if !result.dropped_words.is_empty() {
        println!("Ignored {} unknown words: {}", result.dropped_words.len(), result.dropped_words.join(", "));
    }
    for d in 0..result.n_docs() {
        let mixture: Vec<String> = result.mixture(d).iter().map(|p| format!("{p:.3}")).collect();
        println!(
            "   {:<20} topic {:<3} [{}]",
            corpus.label(d),
            result.primary_topic(d),
            mixture.join(", ")
        );
    }
    Ok(())
}

fn print_topics(model: &PlsaModel, top: usize) {
    let prior = model.topic_prior();
    let top_words = model.top_words(top);
    println!("Topics by prevalence:");
    for topic in model.topics_by_prevalence() {
        let words: Vec<String> = top_words[topic]
            .iter()
            .map(|(word, p)| format!("{word} ({p:.3})"))
            .collect();
        println!("   {:<3} P(z)={:.3}  {}", topic, prior[topic], words.join(", "));
    }
}
