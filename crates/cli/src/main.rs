use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use rand::Rng;

use lam_common::graph::GRAPH_FILE;
use lam_common::{
    build_rect_graph, load_graph, Aggregation, DatasetRegistry, DatasetSplits, EvalSplit, GraphConfig,
    GraphTopology, HyperParam, LossKind, ModelKind, Precision, SplitOptions, WeatherDataset,
};
use lam_train::{load_hyperparams, EvalMetrics, LrDecay, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "lam", about = "Train and evaluate graph-based limited-area weather models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, or evaluate it with `--eval val|test`.
    Train(TrainArgs),
    /// Evaluate a saved checkpoint using its stored hyperparameters.
    Eval(EvalArgs),
    /// Write a synthetic rectangular grid + mesh graph.
    CreateGraph(CreateGraphArgs),
    /// Print the structure of a graph directory.
    InspectGraph(InspectGraphArgs),
    /// List the datasets available in the registry.
    Datasets(DatasetsArgs),
}

// ── Shared ─────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct DataArgs {
    /// Directory holding the dataset default configs.
    #[arg(long, default_value = "config")]
    config_root: PathBuf,
    /// Dataset config overriding the registered default.
    #[arg(long)]
    dataset_config: Option<PathBuf>,
    /// Directory holding one sub-directory per graph.
    #[arg(long, default_value = "graphs")]
    graphs_dir: PathBuf,
    /// Standardise dataset variables.
    #[arg(long)]
    standardize: bool,
    /// Log dataset statistics while loading.
    #[arg(long)]
    diagnose: bool,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    /// Parameter precision: 32, 16 or bf16.
    #[arg(long, default_value = "32")]
    precision: Precision,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,
    #[arg(long, default_value = "dummy")]
    dataset: String,
    /// graph_lam, hi_lam or hi_lam_parallel.
    #[arg(long, default_value = "graph_lam")]
    model: ModelKind,
    /// Graph directory name under `--graphs-dir`.
    #[arg(long, default_value = "multiscale")]
    graph: String,
    #[arg(long, default_value_t = 64)]
    hidden_dim: usize,
    #[arg(long, default_value_t = 1)]
    hidden_layers: usize,
    #[arg(long, default_value_t = 4)]
    processor_layers: usize,
    /// Aggregation of the graph_lam processor: sum or mean.
    #[arg(long, default_value = "sum")]
    mesh_aggr: Aggregation,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    /// mse or mae.
    #[arg(long, default_value = "mse")]
    loss: LossKind,
    #[arg(long, default_value_t = 200)]
    epochs: usize,
    /// Epochs between validation runs.
    #[arg(long, default_value_t = 1)]
    val_interval: usize,
    #[arg(long, default_value_t = 0.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 0.01)]
    weight_decay: f64,
    #[arg(long, default_value_t = 0)]
    lr_warmup_steps: usize,
    #[arg(long, default_value_t = 0.0)]
    lr_min: f64,
    /// cosine, linear or none.
    #[arg(long, default_value = "none")]
    lr_decay: LrDecay,
    #[arg(long, default_value_t = 50)]
    log_every: usize,
    /// Weights to start from.
    #[arg(long)]
    load: Option<PathBuf>,
    /// Also restore epoch, step counters and LR position from `--load`.
    #[arg(long, requires = "load")]
    restore_opt: bool,
    /// Evaluate on this split instead of training.
    #[arg(long)]
    eval: Option<EvalSplit>,
    #[arg(long, default_value = "saved_models")]
    output_root: PathBuf,
}

#[derive(Args, Debug)]
struct EvalArgs {
    #[command(flatten)]
    data: DataArgs,
    /// Checkpoint weights; `hyperparams.json` is read from the same directory.
    #[arg(long)]
    load: PathBuf,
    #[arg(long, default_value = "test")]
    split: EvalSplit,
}

// ── Graphs / datasets ──────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct CreateGraphArgs {
    #[arg(long, default_value = "multiscale")]
    name: String,
    #[arg(long, default_value = "graphs")]
    graphs_dir: PathBuf,
    /// Grid columns.
    #[arg(long, default_value_t = 16)]
    nx: usize,
    /// Grid rows.
    #[arg(long, default_value_t = 12)]
    ny: usize,
    /// Mesh levels; 1 gives a flat mesh.
    #[arg(long, default_value_t = 1)]
    levels: usize,
}

#[derive(Args, Debug)]
struct InspectGraphArgs {
    #[arg(long, default_value = "multiscale")]
    graph: String,
    #[arg(long, default_value = "graphs")]
    graphs_dir: PathBuf,
}

#[derive(Args, Debug)]
struct DatasetsArgs {
    #[arg(long, default_value = "config")]
    config_root: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
        Command::CreateGraph(args) => cmd_create_graph(args),
        Command::InspectGraph(args) => cmd_inspect_graph(args),
        Command::Datasets(args) => cmd_datasets(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

/// `{eval-<split>-}{model}-{layers}x{hidden}-{%m_%d_%H}-{id:04}`
fn run_name(graph: &GraphConfig, eval: Option<EvalSplit>) -> String {
    let prefix = eval.map(|s| format!("eval-{}-", s.name())).unwrap_or_default();
    let id: u32 = rand::thread_rng().gen_range(0..10_000);
    format!(
        "{prefix}{}-{}x{}-{}-{id:04}",
        graph.model,
        graph.processor_layers,
        graph.hidden_dim,
        chrono::Local::now().format("%m_%d_%H"),
    )
}

fn select_device(seed: u64) -> Result<Device> {
    let device = Device::cuda_if_available(0)?;
    if let Err(e) = device.set_seed(seed) {
        tracing::debug!("Device RNG not seeded: {e}");
    }
    tracing::info!(device = ?device, "Using device");
    Ok(device)
}

/// Load datasets and graph, then build a trainer around them.
fn build_trainer(
    data: &DataArgs,
    hp: HyperParam,
    config: impl FnOnce(usize) -> TrainerConfig,
) -> Result<(Trainer, DatasetSplits)> {
    let registry = DatasetRegistry::build(&data.config_root);
    let opts = SplitOptions::new(data.standardize, data.diagnose);
    let splits = registry.get_datasets(&hp.dataset, data.dataset_config.as_deref(), &opts)?;

    let device = select_device(data.seed)?;
    let graph_dir = data.graphs_dir.join(&hp.graph.name);
    let (hierarchical, graph) = load_graph(&graph_dir, splits.train.info(), &device)
        .with_context(|| format!("loading graph {}", graph_dir.display()))?;
    if hierarchical != hp.graph.model.is_hierarchical() {
        bail!(
            "model {} cannot run on {} graph `{}`",
            hp.graph.model,
            if hierarchical { "hierarchical" } else { "flat" },
            hp.graph.name
        );
    }

    let steps_per_epoch = splits.train.len().div_ceil(data.batch_size.max(1));
    let dims = splits.train.info().dims;
    let trainer = Trainer::new(hp, &graph, dims, config(steps_per_epoch), device)?;
    Ok((trainer, splits))
}

fn report(split: EvalSplit, metrics: &EvalMetrics) {
    tracing::info!(split = split.name(), loss = metrics.loss, samples = metrics.samples, "Evaluation");
    for (t, rmse) in metrics.rmse.iter().enumerate() {
        println!("lead {:>3}  rmse {rmse:.6}", t + 1);
    }
    println!("{} loss {:.6} over {} samples", split.name(), metrics.loss, metrics.samples);
}

fn evaluate_split(trainer: &Trainer, splits: &DatasetSplits, split: EvalSplit) -> Result<EvalMetrics> {
    let dataset: &dyn WeatherDataset = match split {
        EvalSplit::Val => splits.val.as_ref(),
        EvalSplit::Test => splits.test.as_ref(),
    };
    trainer.evaluate(dataset)
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let hp = HyperParam {
        dataset: args.dataset.clone(),
        graph: GraphConfig {
            model: args.model,
            name: args.graph.clone(),
            hidden_dim: args.hidden_dim,
            hidden_layers: args.hidden_layers,
            processor_layers: args.processor_layers,
            mesh_aggr: args.mesh_aggr,
        },
        lr: args.lr,
        loss: args.loss,
    };
    let run = run_name(&hp.graph, args.eval);
    let output_dir = args.output_root.join(&run);
    tracing::info!(run = %run, "Starting run");

    let data = &args.data;
    let (mut trainer, splits) = build_trainer(data, hp, |steps_per_epoch| TrainerConfig {
        batch_size: data.batch_size,
        epochs: args.epochs,
        max_steps: args.epochs * steps_per_epoch,
        val_interval: args.val_interval,
        precision: data.precision,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: args.lr_decay,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        log_every: args.log_every,
        seed: data.seed,
        output_dir: output_dir.clone(),
    })?;

    if let Some(path) = &args.load {
        trainer.load_checkpoint(path, args.restore_opt)?;
    }

    if let Some(split) = args.eval {
        let metrics = evaluate_split(&trainer, &splits, split)?;
        report(split, &metrics);
        return Ok(());
    }

    trainer.fit(splits.train.as_ref(), splits.val.as_ref())?;
    eprintln!("Training done. Checkpoints in {}", output_dir.display());
    Ok(())
}

fn cmd_eval(args: EvalArgs) -> Result<()> {
    let hp = load_hyperparams(&args.load)?;
    let run = run_name(&hp.graph, Some(args.split));
    tracing::info!(run = %run, checkpoint = %args.load.display(), "Evaluating checkpoint");

    let data = &args.data;
    let (mut trainer, splits) = build_trainer(data, hp, |_| TrainerConfig {
        batch_size: data.batch_size,
        precision: data.precision,
        seed: data.seed,
        ..Default::default()
    })?;
    trainer.load_checkpoint(&args.load, false)?;
    let metrics = evaluate_split(&trainer, &splits, args.split)?;
    report(args.split, &metrics);
    Ok(())
}

fn cmd_create_graph(args: CreateGraphArgs) -> Result<()> {
    let topology = build_rect_graph(args.nx, args.ny, args.levels)?;
    let dir = args.graphs_dir.join(&args.name);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(GRAPH_FILE);
    topology.save(&path)?;
    print_structure(&topology);
    eprintln!("Saved graph to {}", path.display());
    Ok(())
}

fn cmd_inspect_graph(args: InspectGraphArgs) -> Result<()> {
    let path = args.graphs_dir.join(&args.graph).join(GRAPH_FILE);
    let topology = GraphTopology::load(&path, None)?;
    print_structure(&topology);
    Ok(())
}

fn print_structure(topology: &GraphTopology) {
    let mesh = &topology.mesh;
    println!("grid nodes      {}", topology.num_grid_nodes);
    println!("g2m edges       {}", topology.g2m.num_edges());
    println!("m2g edges       {}", topology.m2g.num_edges());
    println!(
        "mesh levels     {} ({})",
        mesh.num_levels(),
        if mesh.is_hierarchical() { "hierarchical" } else { "flat" }
    );
    for (l, level) in mesh.levels().iter().enumerate() {
        println!(
            "  level {l}: {} nodes, {} same-level edges",
            level.num_nodes(),
            level.m2m().num_edges()
        );
    }
    for (l, (up, down)) in mesh.up().iter().zip(mesh.down()).enumerate() {
        println!(
            "  {l} <-> {}: {} up edges, {} down edges",
            l + 1,
            up.num_edges(),
            down.num_edges()
        );
    }
}

fn cmd_datasets(args: DatasetsArgs) -> Result<()> {
    let registry = DatasetRegistry::build(&args.config_root);
    for name in registry.names() {
        let config = registry.default_config(&name).unwrap_or_else(|| Path::new("-"));
        println!("{name:<12} {}", config.display());
    }
    Ok(())
}
