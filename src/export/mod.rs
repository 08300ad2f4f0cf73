pub mod csv;
pub mod tcx;

use futures_util::TryStreamExt;
use log::{error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::database::{RepositoryError, WorkoutRepository};
use crate::models::WorkoutRecord;

pub use self::csv::build_csv;
pub use self::tcx::build_tcx;

pub const CSV_FILE_NAME: &str = "workouts.csv";
pub const TCX_FILE_NAME: &str = "workouts.tcx";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read workouts: {0}")]
    Repository(#[from] RepositoryError),
}

/// Write all workouts as CSV into `dir`, returning the published path
pub async fn export_csv(
    repository: &dyn WorkoutRepository,
    dir: &Path,
) -> Result<PathBuf, ExportError> {
    let workouts = load_workouts(repository).await?;
    let path = dir.join(CSV_FILE_NAME);
    write_then_publish(&path, build_csv(&workouts).as_bytes()).await?;
    info!("Exported {} workouts to {}", workouts.len(), path.display());
    Ok(path)
}

/// Write all workouts and their samples as TCX into `dir`
pub async fn export_tcx(
    repository: &dyn WorkoutRepository,
    dir: &Path,
) -> Result<PathBuf, ExportError> {
    let workouts = load_workouts(repository).await?;

    let mut samples = HashMap::new();
    for w in &workouts {
        samples.insert(w.id, repository.samples_for_workout(w.id).await?);
    }

    let path = dir.join(TCX_FILE_NAME);
    write_then_publish(&path, build_tcx(&workouts, &samples).as_bytes()).await?;
    info!("Exported {} workouts to {}", workouts.len(), path.display());
    Ok(path)
}

async fn load_workouts(
    repository: &dyn WorkoutRepository,
) -> Result<Vec<WorkoutRecord>, RepositoryError> {
    repository.all_descending().try_collect().await
}

/// Write `contents` to a sibling temp file, then rename it over `path`
///
/// A failed write leaves any previous export untouched and removes the temp file.
async fn write_then_publish(path: &Path, contents: &[u8]) -> Result<(), ExportError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let result = async {
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = result {
        error!("Failed to write {}: {}", path.display(), e);
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
