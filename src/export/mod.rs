//! Parallel export of persisted height tiles to OBJ meshes.
//!
//! ## Architecture
//!
//! Three roles connected by two bounded queues:
//! - **Producer** (calling thread): walks `{in}/tiles`, turns every existing
//!   `lod{k}.height.raw` into an [`ExportJob`] and pushes it on the job queue.
//! - **Workers** (`workers` threads): pop jobs, read the height buffer, build
//!   the grid mesh and push a [`WriteJob`] on the write queue.
//! - **Writer** (one thread): pops write jobs and serializes them to disk, so
//!   files are never written concurrently.
//!
//! Jobs are moved from stage to stage; no stage ever shares one.
//!
//! ## Failure handling
//!
//! The first error raised on any thread is kept in a [`FailureCell`] and both
//! queues are closed at once. Closing wakes every blocked `push`/`pop`, so all
//! threads leave their loops and join. Shutdown on success is ordered: job
//! queue closed after the producer, write queue closed after the workers.
//! Output order across tiles is not deterministic.

pub mod failure;
pub mod queue;

pub use failure::FailureCell;
pub use queue::BoundedQueue;

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, error, info, warn};

use crate::codec;
use crate::config::ExportConfig;
use crate::error::{Result, TerrainError};
use crate::manifest::BuildManifest;
use crate::mesh::{self, GridMesh, MeshParams};
use crate::tiling::{self, TileCoord, TileLayout};

/// One height buffer waiting to be meshed.
#[derive(Clone, Debug)]
pub struct ExportJob {
    pub height_path: PathBuf,
    pub mesh_path: PathBuf,
    pub edge: u32,
    pub tile: TileCoord,
    pub params: MeshParams,
}

/// A built mesh waiting to be written.
#[derive(Debug)]
pub struct WriteJob {
    pub mesh_path: PathBuf,
    pub mesh: GridMesh,
}

/// Summary of a finished export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportReport {
    pub meshes_written: usize,
    pub workers: usize,
}

/// Thread and queue sizing for [`run_pipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Export every persisted tile level under `config.in_dir` as an OBJ mesh.
pub fn run_export(config: &ExportConfig) -> Result<ExportReport> {
    let layout = TileLayout::new(&config.in_dir);
    let tiles_dir = layout.tiles_dir();
    if !tiles_dir.is_dir() {
        return Err(TerrainError::TilesDirMissing(tiles_dir));
    }

    fs::create_dir_all(&config.out_dir)
        .map_err(|e| TerrainError::io(format!("create {}", config.out_dir.display()), e))?;

    match BuildManifest::load(layout.root()) {
        Ok(Some(manifest)) => info!(
            "Tile tree: {} x {} tiles from a {}x{} heightmap, LODs {:?} ({}, {})",
            manifest.tiles_x,
            manifest.tiles_y,
            manifest.source_width,
            manifest.source_height,
            manifest.lod_sizes,
            manifest.filter,
            manifest.kernel
        ),
        Ok(None) => debug!("No build manifest in {}", layout.root().display()),
        Err(e) => warn!("Ignoring unreadable build manifest: {}", e),
    }

    let options = PipelineOptions {
        workers: config.workers.max(1),
        queue_capacity: config.queue_capacity,
    };
    info!(
        "Exporting meshes with {} workers (queue capacity {})",
        options.workers, options.queue_capacity
    );

    let meshes_written = run_pipeline(
        options,
        |emit: &mut dyn FnMut(ExportJob) -> bool| discover_jobs(&tiles_dir, config, emit),
        build_mesh,
        |job: WriteJob| {
            codec::write_obj(&job.mesh_path, &job.mesh)?;
            debug!("Wrote {}", job.mesh_path.display());
            Ok(())
        },
    )?;

    Ok(ExportReport {
        meshes_written,
        workers: options.workers,
    })
}

/// Producer: push one job per existing `(tile, lod)` height buffer.
///
/// Directories that are not named `tile_<x>_<y>` are skipped. Stops as soon
/// as `emit` reports that the pipeline is shutting down.
fn discover_jobs(
    tiles_dir: &Path,
    config: &ExportConfig,
    emit: &mut dyn FnMut(ExportJob) -> bool,
) -> Result<()> {
    let context = || format!("list {}", tiles_dir.display());
    let entries = fs::read_dir(tiles_dir).map_err(|e| TerrainError::io(context(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| TerrainError::io(context(), e))?;
        let tile_dir = entry.path();
        if !tile_dir.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(folder) = file_name.to_str() else {
            warn!("Skipping non UTF-8 tile folder {}", tile_dir.display());
            continue;
        };
        let Some(tile) = TileCoord::parse_folder_name(folder) else {
            warn!("Skipping unrecognised folder {}", tile_dir.display());
            continue;
        };

        for lod in 0..config.lod_count {
            let Some(edge) = tiling::lod_edge(lod) else {
                break;
            };
            let height_path = tile_dir.join(tiling::height_file_name(lod));
            if !height_path.is_file() {
                continue;
            }

            let job = ExportJob {
                height_path,
                mesh_path: tiling::mesh_path(&config.out_dir, folder, lod),
                edge,
                tile,
                params: config.mesh,
            };
            if !emit(job) {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Worker: read one height buffer and mesh it.
fn build_mesh(job: ExportJob) -> Result<WriteJob> {
    let heights = codec::read_height_buffer(&job.height_path, job.edge)?;
    let mesh = mesh::build_grid_mesh(&heights, job.edge, job.params, job.tile.tx, job.tile.ty)?;
    Ok(WriteJob {
        mesh_path: job.mesh_path,
        mesh,
    })
}

/// Run a producer / worker-pool / single-writer pipeline to completion.
///
/// `produce` runs on the calling thread and feeds jobs through the callback
/// it is given; the callback returns `false` once the pipeline is shutting
/// down. `work` runs on `options.workers` threads, `write` on one thread.
///
/// Returns the number of items written, or the first error raised by any
/// stage. A panicking stage counts as a failure.
pub fn run_pipeline<J, W, P, F, G>(
    options: PipelineOptions,
    produce: P,
    work: F,
    write: G,
) -> Result<usize>
where
    J: Send,
    W: Send,
    P: FnOnce(&mut dyn FnMut(J) -> bool) -> Result<()>,
    F: Fn(J) -> Result<W> + Sync,
    G: FnMut(W) -> Result<()> + Send,
{
    let jobs = BoundedQueue::<J>::new(options.queue_capacity);
    let writes = BoundedQueue::<W>::new(options.queue_capacity);
    let failure = FailureCell::new();

    let abort = |role: &'static str, err: TerrainError| {
        let message = err.to_string();
        if failure.record(err) {
            error!("{} failed, stopping pipeline: {}", role, message);
        } else {
            debug!("{} failed after shutdown: {}", role, message);
        }
        jobs.close();
        writes.close();
    };
    let settle = |role: &'static str, outcome: thread::Result<Result<()>>| match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => abort(role, err),
        Err(_) => abort(role, TerrainError::StagePanicked(role)),
    };

    let (jobs, writes, work, failed) = (&jobs, &writes, &work, &failure);

    let written = thread::scope(|s| {
        let writer = s.spawn(move || {
            let mut write = write;
            let mut count = 0usize;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                // Items still queued when a stage fails are drained, not written
                while let Some(item) = writes.pop() {
                    if failed.is_set() {
                        continue;
                    }
                    write(item)?;
                    count += 1;
                }
                Ok(())
            }));
            settle("writer", outcome);
            count
        });

        let workers: Vec<_> = (0..options.workers.max(1))
            .map(|_| {
                s.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                        while let Some(job) = jobs.pop() {
                            let item = work(job)?;
                            if writes.push(item).is_err() {
                                break;
                            }
                        }
                        Ok(())
                    }));
                    settle("worker", outcome);
                })
            })
            .collect();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            produce(&mut |job: J| !failure.is_set() && jobs.push(job).is_ok())
        }));
        settle("producer", outcome);

        jobs.close();
        for worker in workers {
            if worker.join().is_err() {
                abort("worker", TerrainError::StagePanicked("worker"));
            }
        }

        writes.close();
        writer.join().unwrap_or_else(|_| {
            abort("writer", TerrainError::StagePanicked("writer"));
            0
        })
    });

    match failure.into_inner() {
        Some(err) => Err(err),
        None => Ok(written),
    }
}
