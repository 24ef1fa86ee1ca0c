//! Super-resolve audio files with a trained checkpoint

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use tracing::{info, warn};

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::networks::NetworkBundle;
use crate::runtime::{CancellationToken, RunContext};
use crate::training::checkpoints::CheckpointManager;
use crate::training::data::audio::{read_wav, write_wav};
use crate::training::data::read_manifest;
use crate::utils::io::ensure_dir_exists;

/// Directory under the checkpoint directory receiving enhanced files
pub const OUTPUT_DIR: &str = "inference";

/// Inputs named by `input_path`: a single WAV file or a manifest of them
pub fn collect_inputs(input_path: &Path) -> Result<Vec<PathBuf>> {
    let is_wav = input_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    if is_wav {
        Ok(vec![input_path.to_path_buf()])
    } else {
        read_manifest(input_path)
    }
}

/// Load trained weights and write `<stem>_sr.wav` for every input
///
/// With several ranks, inputs are split round-robin between them.
pub fn run(
    ctx: &RunContext,
    config: &TrainConfig,
    networks: &mut NetworkBundle,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    let input_path = config
        .input_path
        .as_deref()
        .ok_or_else(|| Error::config("inference requires --input-path"))?;

    CheckpointManager::new(&config.checkpoint_dir, ctx.is_primary()).restore_for_inference(networks)?;

    let output_dir = config.checkpoint_dir.join(OUTPUT_DIR);
    ensure_dir_exists(&output_dir)?;

    let chunk = config.segment_samples().max(config.frame_hop);
    let mut written = Vec::new();
    for input in collect_inputs(input_path)?
        .into_iter()
        .skip(ctx.rank())
        .step_by(ctx.world_size().max(1))
    {
        if cancel.is_cancelled() {
            warn!("Inference cancelled after {} file(s)", written.len());
            break;
        }

        let audio = read_wav(&input, config.sampling_rate)?;
        let enhanced = enhance(ctx, networks, &audio, chunk)?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let output = output_dir.join(format!("{}_sr.wav", stem));
        write_wav(&output, &enhanced, config.sampling_rate)?;
        info!("{} -> {}", input.display(), output.display());
        written.push(output);
    }

    Ok(written)
}

/// Run the generator over `audio` in fixed-size chunks
fn enhance(ctx: &RunContext, networks: &NetworkBundle, audio: &[f32], chunk: usize) -> Result<Vec<f32>> {
    let mut enhanced = Vec::with_capacity(audio.len());
    for piece in audio.chunks(chunk) {
        let input = Tensor::from_slice(piece, (1, piece.len()), &ctx.device)?;
        let output = networks.super_resolve(&input)?.detach();
        enhanced.extend(output.flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(enhanced)
}
