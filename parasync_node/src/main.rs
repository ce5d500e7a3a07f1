//! Parasync demo node: trains a small least-squares model with SGD over
//! synthetic data on every node of the cluster.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use parasync::{
    logger_init, pf_error, pf_info, ClusterConfig, Engine, Key, MlTask,
    ModelType, NodeId, ParasyncError, StorageType, WorkerAlloc,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Weights the synthetic samples are generated from.
const TRUE_WEIGHTS: [f64; 4] = [1.0, -2.0, 0.5, 3.0];

/// SGD step size.
const LEARNING_RATE: f64 = 0.5;

/// One synthetic sample: features and label.
type Sample = (Vec<f64>, f64);

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster TOML file; runs as a single node if absent.
    #[arg(long)]
    cluster: Option<PathBuf>,

    /// My node ID, overriding the one in the cluster file.
    #[arg(long)]
    me: Option<NodeId>,

    /// Engine configuration TOML string.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Worker threads per node.
    #[arg(short, long, default_value_t = 2)]
    workers: u16,

    /// Passes over the data.
    #[arg(short, long, default_value_t = 10)]
    epochs: u32,

    /// Consistency model: asp, bsp or ssp.
    #[arg(short, long, default_value_t = String::from("bsp"))]
    model: String,

    /// Staleness bound for ssp.
    #[arg(short, long, default_value_t = 1)]
    staleness: u64,

    /// Synthetic samples owned per node.
    #[arg(long, default_value_t = 1000)]
    samples: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(model_type)` on success
    /// or `Err(ParasyncError)` on any error.
    fn sanitize(&self) -> Result<ModelType, ParasyncError> {
        if self.workers == 0 {
            Err(ParasyncError::msg(format!(
                "invalid number of workers {}",
                self.workers
            )))
        } else if self.epochs == 0 {
            Err(ParasyncError::msg(format!(
                "invalid number of epochs {}",
                self.epochs
            )))
        } else if self.samples == 0 {
            Err(ParasyncError::msg(format!(
                "invalid number of samples {}",
                self.samples
            )))
        } else {
            match self.model.to_lowercase().as_str() {
                "asp" => Ok(ModelType::Asp),
                "bsp" => Ok(ModelType::Bsp),
                "ssp" => Ok(ModelType::Ssp {
                    staleness: self.staleness,
                }),
                _ => Err(ParasyncError::msg(format!(
                    "model name '{}' unrecognized",
                    self.model
                ))),
            }
        }
    }

    fn load_cluster(&self) -> Result<ClusterConfig, ParasyncError> {
        let mut cluster = match self.cluster {
            Some(ref path) => {
                ClusterConfig::from_toml(&fs::read_to_string(path)?)?
            }
            None => ClusterConfig::single(),
        };
        if let Some(me) = self.me {
            cluster.me = me;
            cluster.validate()?;
        }
        Ok(cluster)
    }
}

/// Generates `n` samples of node `node`, identical on every node.
fn synthetic_samples(node: NodeId, n: usize) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(node as u64);
    (0..n)
        .map(|_| {
            let x: Vec<f64> = TRUE_WEIGHTS
                .iter()
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect();
            let y = dot(&x, &TRUE_WEIGHTS) + rng.gen_range(-0.01..0.01);
            (x, y)
        })
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Local data store: my samples followed by a copy of the next node's.
fn load_data_store(
    cluster: &ClusterConfig,
    samples: usize,
) -> (Vec<Sample>, usize) {
    let mut data = synthetic_samples(cluster.me, samples);
    let ids = cluster.node_ids();
    if ids.len() > 1 {
        let pos = ids.iter().position(|&id| id == cluster.me).unwrap_or(0);
        let helpee = ids[(pos + 1) % ids.len()];
        data.extend(synthetic_samples(helpee, samples));
    }
    (data, samples)
}

/// Actual main function of the demo node.
fn node_main() -> Result<(), ParasyncError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let model_type = args.sanitize()?;
    let cluster = args.load_cluster()?;
    let nodes = cluster.node_ids();

    // set up termination signals handler
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || stop_flag.store(true, Ordering::SeqCst))
        .map_err(|e| ParasyncError::msg(e.to_string()))?;

    let (data, divider) = load_data_store(&cluster, args.samples);
    let data = Arc::new(data);

    let mut engine = Engine::new(cluster, Some(&args.config))?;
    engine.start_everything()?;
    let table = engine.create_table::<f64>(model_type, StorageType::Map)?;

    let epochs = args.epochs;
    let workers = args.workers;
    let keys: Vec<Key> = (0..TRUE_WEIGHTS.len() as Key).collect();
    let mut task = MlTask::new();
    task.set_worker_alloc(
        nodes
            .iter()
            .map(|&node_id| WorkerAlloc {
                node_id,
                num_workers: workers,
            })
            .collect(),
    )
    .set_tables(vec![table])
    .set_data_range(data.len(), divider)
    .set_lambda(move |info| {
        let table = match info.create_kv_client_table::<f64>(table) {
            Ok(table) => table,
            Err(e) => {
                pf_error!("worker {}: {}", info.worker_id, e);
                return;
            }
        };
        let scale = (nodes.len() * workers as usize) as f64;

        let train = || -> Result<(), ParasyncError> {
            for epoch in 0..epochs {
                let weights = table.get(&keys)?;
                let mut grad = vec![0.0; keys.len()];
                let mut count = 0;
                // keep clocking once stopped so peers are not blocked
                if !stop.load(Ordering::SeqCst) {
                    while let Some(idx) = info.next_sample()? {
                        let (x, y) = &data[idx];
                        let err = dot(x, &weights) - y;
                        for (g, xi) in grad.iter_mut().zip(x) {
                            *g += err * xi;
                        }
                        count += 1;
                    }
                }
                if count > 0 {
                    let step: Vec<f64> = grad
                        .iter()
                        .map(|g| -LEARNING_RATE * g / count as f64 / scale)
                        .collect();
                    table.add(&keys, &step)?;
                }
                table.clock()?;
                if info.worker_id == 0 {
                    pf_info!("epoch {} weights {:?}", epoch, weights);
                }
            }
            if info.worker_id == 0 {
                pf_info!("learned weights {:?}", table.get(&keys)?);
            }
            Ok(())
        };
        if let Err(e) = train() {
            pf_error!("worker {} failed: {}", info.worker_id, e);
        }
    });

    engine.run(&task)?;
    engine.stop_everything()
}

/// Main function of the demo node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
