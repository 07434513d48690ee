#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;

use ironmeta::data::{Outcome, StudyTable, load_study_table};
use ironmeta::estimate::{RemlOptions, fit_spline_meta_regression};
use ironmeta::model::AnalysisConfig;
use ironmeta::pipeline::{PipelineError, analyze_all, pooled_analysis};
use ironmeta::report::write_report;
use ironmeta::sensitivity::sweep_knots;

#[derive(Clone, Copy, ValueEnum)]
pub enum OutcomeCli {
    Ferritin,
    Vo2max,
}

impl From<OutcomeCli> for Outcome {
    fn from(value: OutcomeCli) -> Self {
        match value {
            OutcomeCli::Ferritin => Outcome::Ferritin,
            OutcomeCli::Vo2max => Outcome::Vo2max,
        }
    }
}

/// Options shared by every subcommand.
#[derive(Args)]
pub struct CommonArgs {
    /// Path to the study CSV (id, ferritin_effect_size_smd, ferritin_std_error_smd,
    /// vo2max_effect_size, vo2max_std_error, initial_ferritin_ng_ml)
    #[arg(value_name = "STUDIES_CSV")]
    pub studies: PathBuf,

    /// Analysis settings in TOML; missing keys take their defaults
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Reject rows with a half-missing VO2max pair instead of flagging them
    #[arg(long)]
    pub strict_pairing: bool,
}

#[derive(Args)]
pub struct PoolArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Outcome to pool; both when omitted
    #[arg(long, value_enum)]
    pub outcome: Option<OutcomeCli>,
}

#[derive(Args)]
pub struct RegressArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, value_enum)]
    pub outcome: OutcomeCli,

    /// Number of spline knots; the configured value for the outcome when omitted
    #[arg(long)]
    pub knots: Option<usize>,

    /// Number of points on the prediction grid
    #[arg(long)]
    pub grid_points: Option<usize>,
}

#[derive(Args)]
pub struct SweepArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, value_enum)]
    pub outcome: OutcomeCli,

    /// Comma-separated knot counts to compare
    #[arg(long, value_delimiter = ',')]
    pub knots: Option<Vec<usize>>,

    /// Number of points on the prediction grid
    #[arg(long)]
    pub grid_points: Option<usize>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Directory that receives the TSV tables and summary.toml
    #[arg(long, default_value = "ironmeta_results")]
    pub out_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "ironmeta",
    about = "Random-effects meta-analysis and spline meta-regression of iron supplementation studies",
    long_about = "Pools study-level effect sizes for ferritin and VO2max with REML random-effects \
                 models and tests initial serum ferritin as a non-linear moderator with cubic \
                 regression spline meta-regression."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Unconditional random-effects meta-analysis
    #[command(about = "Pool effect sizes with a REML random-effects model")]
    Pool(PoolArgs),

    /// Spline meta-regression on initial ferritin
    #[command(about = "Fit a cubic regression spline meta-regression")]
    Regress(RegressArgs),

    /// Knot-count sensitivity analysis
    #[command(about = "Compare spline meta-regressions across knot counts")]
    Sweep(SweepArgs),

    /// Full analysis of both outcomes with report files
    #[command(about = "Run every analysis and write the report tables")]
    Analyze(AnalyzeArgs),
}

fn load_inputs(common: &CommonArgs) -> Result<(StudyTable, AnalysisConfig), PipelineError> {
    let mut config = match &common.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            AnalysisConfig::load(path)?
        }
        None => AnalysisConfig::default(),
    };
    if common.strict_pairing {
        config.strict_pairing = true;
    }

    println!("Loading studies from: {}", common.studies.display());
    let table = load_study_table(&common.studies, config.pairing_policy())?;
    println!("Loaded {} studies", table.len());
    for id in table.flagged() {
        println!("Flagged study '{id}': VO2max pair incomplete, excluded from VO2max analyses");
    }
    Ok((table, config))
}

fn run_pool(args: PoolArgs) -> Result<(), PipelineError> {
    let (table, config) = load_inputs(&args.common)?;
    let options = RemlOptions::from(&config);
    let outcomes: Vec<Outcome> = match args.outcome {
        Some(outcome) => vec![outcome.into()],
        None => Outcome::ALL.to_vec(),
    };

    for outcome in outcomes {
        let data = table.outcome_data(outcome);
        let (fit, forest) =
            pooled_analysis(&data, &options).map_err(PipelineError::estimation(outcome))?;
        let pooled = fit.pooled();
        let (pi_lower, pi_upper) = fit.prediction_interval();

        println!("\n{outcome}: random-effects model (k = {}, REML)", data.len());
        println!("{:<8} {:>9} {:>16} {:>8}", "study", "SMD", "95% CI", "weight");
        for row in &forest {
            println!(
                "{:<8} {:>9.3} [{:>6.3}, {:>6.3}] {:>7.2}%",
                row.id, row.effect, row.ci_lower, row.ci_upper, row.weight_percent
            );
        }
        println!(
            "Pooled SMD {:.3} (SE {:.3}), CI [{:.3}, {:.3}], z = {:.3}, p = {:.3e}",
            pooled.estimate,
            pooled.std_error,
            pooled.ci_lower,
            pooled.ci_upper,
            pooled.z_value,
            pooled.p_value
        );
        println!("Prediction interval [{pi_lower:.3}, {pi_upper:.3}]");
        println!(
            "tau^2 = {:.4}{}, I^2 = {:.1}%, H^2 = {:.2}, Q({}) = {:.3}, p = {:.3e}",
            fit.tau2,
            if fit.tau2_truncated { " (truncated at zero)" } else { "" },
            fit.heterogeneity.i2,
            fit.heterogeneity.h2,
            fit.heterogeneity.df,
            fit.heterogeneity.q_e,
            fit.heterogeneity.p_value
        );
    }
    Ok(())
}

fn run_regress(args: RegressArgs) -> Result<(), PipelineError> {
    let (table, mut config) = load_inputs(&args.common)?;
    if let Some(points) = args.grid_points {
        config.grid_points = points;
        config.validate()?;
    }
    let outcome: Outcome = args.outcome.into();
    let knots = args.knots.unwrap_or_else(|| config.knots_for(outcome));
    let data = table.outcome_data(outcome);

    println!("Fitting {outcome} spline meta-regression with {knots} knots...");
    let model = fit_spline_meta_regression(&data, knots, &RemlOptions::from(&config))
        .map_err(PipelineError::estimation(outcome))?;
    let fit = &model.fit;

    println!("{:<16} {:>9} {:>9} {:>9}", "coefficient", "estimate", "se", "p");
    for c in &fit.coefficients {
        println!(
            "{:<16} {:>9.4} {:>9.4} {:>9.3e}",
            c.name, c.estimate, c.std_error, c.p_value
        );
    }
    if let Some(test) = &fit.omnibus {
        println!(
            "Test of moderators: QM({}) = {:.3}, p = {:.3e}",
            test.df, test.qm, test.p_value
        );
    }
    println!(
        "Residual heterogeneity: tau^2 = {:.4}{}, QE({}) = {:.3}, p = {:.3e}",
        fit.tau2,
        if fit.tau2_truncated { " (truncated at zero)" } else { "" },
        fit.heterogeneity.df,
        fit.heterogeneity.q_e,
        fit.heterogeneity.p_value
    );

    let curve = model.predict_grid(config.grid_points)?;
    println!("\n{:>10} {:>9} {:>9} {:>9}", "ferritin", "estimate", "lower", "upper");
    for point in &curve.points {
        println!(
            "{:>10.2} {:>9.4} {:>9.4} {:>9.4}",
            point.moderator, point.estimate, point.ci_lower, point.ci_upper
        );
    }
    Ok(())
}

fn run_sweep(args: SweepArgs) -> Result<(), PipelineError> {
    let (table, mut config) = load_inputs(&args.common)?;
    if let Some(points) = args.grid_points {
        config.grid_points = points;
        config.validate()?;
    }
    let knots = args.knots.unwrap_or_else(|| config.sensitivity_knots.clone());
    let outcome: Outcome = args.outcome.into();
    let data = table.outcome_data(outcome);

    println!("Sweeping {outcome} spline meta-regression over K = {knots:?}...");
    let report = sweep_knots(&data, &knots, config.grid_points, &RemlOptions::from(&config));
    for (k, curve) in report.curves() {
        let estimates = curve.estimates();
        let min = estimates.iter().copied().fold(f64::INFINITY, f64::min);
        let max = estimates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        println!("K = {k}: predicted effect ranges from {min:.3} to {max:.3}");
    }
    for (k, err) in report.failures() {
        println!("K = {k}: failed ({err})");
    }
    Ok(())
}

fn run_analyze(args: AnalyzeArgs) -> Result<(), PipelineError> {
    let (table, config) = load_inputs(&args.common)?;
    println!("Running full analysis...");
    let reports = analyze_all(&table, &config)?;
    for report in &reports {
        let pooled = report.pooled.pooled();
        println!(
            "{}: pooled SMD {:.3} [{:.3}, {:.3}] over {} studies",
            report.outcome,
            pooled.estimate,
            pooled.ci_lower,
            pooled.ci_upper,
            report.num_studies()
        );
        if let Some(test) = &report.spline.fit.omnibus {
            println!(
                "{}: spline (K = {}) QM({}) = {:.3}, p = {:.3e}",
                report.outcome,
                report.spline.num_knots(),
                test.df,
                test.qm,
                test.p_value
            );
        }
    }

    let written = write_report(&reports, table.flagged(), &args.out_dir)?;
    save_config(&config, &args.out_dir)?;
    println!(
        "Wrote {} files to: {}",
        written.len() + 1,
        args.out_dir.display()
    );
    Ok(())
}

fn save_config(config: &AnalysisConfig, out_dir: &Path) -> Result<(), PipelineError> {
    config.save(out_dir.join("config.toml"))?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Pool(args)) => run_pool(args),
        Some(Commands::Regress(args)) => run_regress(args),
        Some(Commands::Sweep(args)) => run_sweep(args),
        Some(Commands::Analyze(args)) => run_analyze(args),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
