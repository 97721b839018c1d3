use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use terrain_tiler::codec;
use terrain_tiler::config::{self, BuildConfig, ExportConfig};
use terrain_tiler::export;
use terrain_tiler::kernel::{KernelChoice, ReduceFilter};
use terrain_tiler::lod_builder;
use terrain_tiler::mesh::MeshParams;
use terrain_tiler::Result;

#[derive(Parser, Debug)]
#[command(name = "terrain_tiler")]
#[command(about = "Cut a 16-bit heightmap into LOD tiles and export them as meshes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cut a heightmap into 256x256 tiles and persist each LOD level
    Build {
        /// 16-bit grayscale heightmap (width and height multiples of 256)
        #[arg(long, default_value = "assets/hm.png")]
        heightmap: PathBuf,

        /// Output directory for the tile tree
        #[arg(long, default_value = "out/world")]
        out: PathBuf,

        /// Number of LOD levels per tile (level 0 = full resolution)
        #[arg(long, default_value_t = config::DEFAULT_LOD_COUNT)]
        lods: u32,

        /// Compute kernel to run extraction and reduction on
        #[arg(long, value_enum, default_value_t = KernelChoice::Auto)]
        kernel: KernelChoice,

        /// How 2x2 blocks are combined when halving a level
        #[arg(long, value_enum, default_value_t = ReduceFilter::Average)]
        filter: ReduceFilter,
    },

    /// Convert persisted tiles into OBJ meshes
    #[command(name = "export_mesh")]
    ExportMesh {
        /// Build output directory (reads `<in>/tiles/tile_x_y/lod*.height.raw`)
        #[arg(long = "in", default_value = "out/world")]
        in_dir: PathBuf,

        /// Directory receiving the .obj files
        #[arg(long, default_value = "out/meshes")]
        out: PathBuf,

        /// Number of LOD levels to export per tile
        #[arg(long, default_value_t = config::DEFAULT_LOD_COUNT)]
        lods: u32,

        /// World height of the maximum sample value
        #[arg(long, default_value_t = 100.0)]
        scale: f32,

        /// World distance between neighbouring samples
        #[arg(long, default_value_t = 1.0)]
        spacing: f32,

        /// Mesh-building worker threads (default: hardware threads - 1)
        #[arg(long)]
        workers: Option<usize>,

        /// Capacity of each pipeline queue
        #[arg(long, default_value_t = config::DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,
    },

    /// Print the size and value range of one height buffer
    Inspect {
        /// A `lod<k>.height.raw` file
        #[arg(long)]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let (operation, result) = match cli.command {
        Command::Build {
            heightmap,
            out,
            lods,
            kernel,
            filter,
        } => {
            let config = BuildConfig {
                heightmap_path: heightmap,
                out_dir: out,
                lod_count: lods,
                kernel,
                filter,
            };
            ("build", run_build(&config))
        }
        Command::ExportMesh {
            in_dir,
            out,
            lods,
            scale,
            spacing,
            workers,
            queue_capacity,
        } => {
            let config = ExportConfig {
                in_dir,
                out_dir: out,
                lod_count: lods,
                mesh: MeshParams {
                    spacing,
                    height_scale: scale,
                },
                workers: workers.unwrap_or_else(config::default_worker_count),
                queue_capacity,
            };
            ("export_mesh", run_export(&config))
        }
        Command::Inspect { file } => ("inspect", run_inspect(&file)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} error: {}", operation, e);
            ExitCode::FAILURE
        }
    }
}

fn run_build(config: &BuildConfig) -> Result<()> {
    let report = lod_builder::run_build(config)?;
    println!(
        "Built {} tiles ({} height buffers, LODs {:?}) in {}",
        report.tiles,
        report.height_buffers,
        report.lod_sizes,
        config.out_dir.display()
    );
    Ok(())
}

fn run_export(config: &ExportConfig) -> Result<()> {
    let report = export::run_export(config)?;
    println!(
        "Exported {} OBJ files to: {}",
        report.meshes_written,
        config.out_dir.display()
    );
    Ok(())
}

fn run_inspect(file: &Path) -> Result<()> {
    let (edge, samples) = codec::read_height_buffer_square(file)?;
    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    println!("{}: {}x{} samples", file.display(), edge, edge);
    println!("Height range: {} to {} (mean {:.1})", min, max, mean);
    Ok(())
}
