#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nonzero::nonzero as nz;

use coretile::cache::TilingCache;
use coretile::common::{DimSize, Dtype};
use coretile::pprint::pprint;
use coretile::problem::{FmapFormat, Padding, ProblemShape, WeightFormat};
use coretile::target::{HardwareBudget, MemoryLevel, TargetId};
use coretile::{plan, plan_many};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target device preset
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Override the preset's core count
    #[arg(long)]
    cores: Option<u32>,

    /// Override the preset's L1 capacity, in bytes
    #[arg(long)]
    l1_bytes: Option<u64>,

    /// Number of threads used when planning several problems
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Plan every power-of-two batch size up to the given batch
    #[arg(long, default_value_t = false)]
    batch_sweep: bool,

    #[command(subcommand)]
    problem: ProblemCmd,
}

#[derive(clap::Args)]
struct ConvOpts {
    #[arg(long, short, default_value = "1")]
    batch: DimSize,
    #[arg(long, default_value = "64")]
    channels: DimSize,
    #[arg(long, default_value = "64")]
    filters: DimSize,
    #[arg(long, default_value = "3")]
    kernel: DimSize,
    #[arg(long, default_value = "1")]
    stride: DimSize,
    /// Padding applied to every spatial side
    #[arg(long, default_value_t = 0)]
    pad: u32,
    #[arg(long, default_value = "1")]
    dilation: DimSize,
    #[arg(long, default_value = "1")]
    groups: DimSize,
    #[arg(long, value_enum, default_value_t = Dtype::Float16)]
    dtype: Dtype,
    #[arg(long, value_enum)]
    format: Option<FmapFormat>,
    /// Weight is pre-blocked into fractals
    #[arg(long, default_value_t = false)]
    fractal_weight: bool,
}

#[derive(clap::Subcommand)]
enum ProblemCmd {
    #[command(about = "Plan a 2-D convolution")]
    Conv2d {
        #[command(flatten)]
        opts: ConvOpts,
        size: DimSize,
    },
    #[command(about = "Plan a 3-D convolution")]
    Conv3d {
        #[command(flatten)]
        opts: ConvOpts,
        #[arg(long, default_value = "3")]
        kernel_depth: DimSize,
        depth: DimSize,
        size: DimSize,
    },
    #[command(about = "Plan a matrix multiplication")]
    Matmul { m: DimSize, k: DimSize, n: DimSize },
}

impl ConvOpts {
    fn apply(&self, problem: ProblemShape) -> ProblemShape {
        let weight_format = if self.fractal_weight {
            WeightFormat::Fractal
        } else {
            WeightFormat::Nd
        };
        let fmap_format = self.format.unwrap_or(problem.fmap_format);
        let (depth_stride, depth_pad) = if problem.is_3d() {
            (self.stride, self.pad)
        } else {
            (nz!(1u32), 0)
        };
        problem
            .with_stride([depth_stride, self.stride, self.stride])
            .with_dilation([nz!(1u32), self.dilation, self.dilation])
            .with_pad(Padding {
                head: depth_pad,
                tail: depth_pad,
                top: self.pad,
                bottom: self.pad,
                left: self.pad,
                right: self.pad,
            })
            .with_groups(self.groups)
            .with_format(fmap_format, weight_format)
            .with_dtypes(self.dtype, self.dtype, self.dtype)
    }
}

impl Args {
    /// The target preset with any command-line overrides applied.
    fn budget(&self) -> HardwareBudget {
        let mut budget = HardwareBudget::for_target(self.target);
        if let Some(cores) = self.cores {
            budget = budget.with_cores(cores);
        }
        if let Some(l1_bytes) = self.l1_bytes {
            budget = budget.with_capacity(MemoryLevel::L1, l1_bytes);
        }
        budget
    }
}

fn build_problem(cmd: &ProblemCmd) -> ProblemShape {
    match cmd {
        ProblemCmd::Conv2d { opts, size } => {
            let problem = ProblemShape::conv2d(
                opts.batch,
                opts.channels,
                opts.filters,
                [*size, *size],
                [opts.kernel, opts.kernel],
            );
            opts.apply(problem)
        }
        ProblemCmd::Conv3d {
            opts,
            kernel_depth,
            depth,
            size,
        } => {
            let problem = ProblemShape::conv3d(
                opts.batch,
                opts.channels,
                opts.filters,
                [*depth, *size, *size],
                [*kernel_depth, opts.kernel, opts.kernel],
            );
            opts.apply(problem)
        }
        ProblemCmd::Matmul { m, k, n } => ProblemShape::matmul(*m, *k, *n),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let budget = args.budget();
    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("configuring the planning thread pool")?;
    }

    let problem = build_problem(&args.problem);
    info!("Planning {problem} on {:?}", args.target);

    if args.batch_sweep {
        let problems = (0..=problem.batch.get().ilog2())
            .map(|shift| {
                let mut p = problem.clone();
                p.batch = DimSize::new(1 << shift).unwrap_or(nz!(1u32));
                p
            })
            .collect::<Vec<_>>();
        let cache = TilingCache::default();
        let start_time = std::time::Instant::now();
        let results = plan_many(&problems, &budget, &cache);
        info!("plan_many took {:?}", start_time.elapsed());
        for (p, result) in problems.iter().zip(results) {
            let tiling = result.with_context(|| format!("planning {p}"))?;
            println!("batch {}: key {}", p.batch, tiling.dispatch_key());
            pprint(&tiling);
        }
        return Ok(());
    }

    let tiling = plan(&problem, &budget).with_context(|| format!("planning {problem}"))?;
    pprint(&tiling);
    println!("\ndispatch key: {}", tiling.dispatch_key());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l1_override_replaces_only_l1() {
        let args = Args::parse_from([
            "frontend", "--target", "edge", "--l1-bytes", "65536", "matmul", "64", "64", "64",
        ]);
        let preset = HardwareBudget::for_target(TargetId::Edge);
        let budget = args.budget();
        assert_eq!(budget.capacity(MemoryLevel::L1), 65536);
        assert_eq!(budget, preset.with_capacity(MemoryLevel::L1, 65536));
    }

    #[test]
    fn test_no_overrides_keeps_preset() {
        let args = Args::parse_from(["frontend", "matmul", "64", "64", "64"]);
        assert_eq!(args.budget(), HardwareBudget::default());
    }
}
