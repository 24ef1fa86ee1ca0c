//! Test fixtures: a tiny corpus on disk and a configuration sized for it

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::TrainConfig;
use crate::networks::{NetworkBundle, NetworkKind};
use crate::runtime::{init_environment, CancellationToken, DistInfo, RunContext};
use crate::training::data::audio::write_wav;
use crate::training::data::{build_generators, ManifestLoaderFactory};
use crate::training::solver::Solver;

pub const RATE: u32 = 8000;

/// Write a short harmonic clip of `samples` samples at [`RATE`]
pub fn write_clip(path: &Path, samples: usize, pitch: f32) {
    let audio: Vec<f32> = (0..samples)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            0.3 * (2.0 * std::f32::consts::PI * pitch * t).sin()
                + 0.1 * (2.0 * std::f32::consts::PI * 3.0 * pitch * t).sin()
        })
        .collect();
    write_wav(path, &audio, RATE).unwrap();
}

/// Temporary corpus with train/valid/test manifests
pub struct TrainingTestFixture {
    pub dir: TempDir,
    pub config: TrainConfig,
}

impl TrainingTestFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let clips = dir.path().join("clips");
        fs::create_dir_all(&clips).unwrap();

        let mut names = Vec::new();
        for i in 0..6 {
            let name = format!("clip_{}.wav", i);
            write_clip(&clips.join(&name), 600 + 100 * i, 110.0 * (i + 1) as f32);
            names.push(format!("clips/{}", name));
        }

        let manifest = |file: &str, entries: &[String]| -> PathBuf {
            let path = dir.path().join(file);
            fs::write(&path, entries.join("\n")).unwrap();
            path
        };
        let tr_list = manifest("train.lst", &names[..4]);
        let cv_list = manifest("valid.lst", &names[4..]);
        let tt_list = manifest("test.lst", &names[4..]);

        let config = TrainConfig {
            seed: 13,
            use_cuda: false,
            checkpoint_dir: dir.path().join("checkpoints"),
            tr_list: Some(tr_list),
            cv_list: Some(cv_list),
            tt_list: Some(tt_list.to_string_lossy().into_owned()),
            batch_size: 2,
            max_epoch: 2,
            max_length: 0.05,
            sampling_rate: RATE,
            lr_sampling_rates: vec![2000, 4000],
            hidden_channels: 4,
            frame_hop: 40,
            num_workers: 2,
            print_freq: 1,
            checkpoint_save_freq: 0,
            early_stop_patience: 0,
            ..TrainConfig::default()
        };

        Self { dir, config }
    }

    pub fn ctx(&self) -> RunContext {
        init_environment(&self.config, &DistInfo::single()).unwrap()
    }

    pub fn networks(&self) -> NetworkBundle {
        NetworkKind::MossFormer2Sr48k.build(&self.ctx(), &self.config).unwrap()
    }

    /// Solver over the fixture corpus
    pub fn solver(&self, cancel: CancellationToken) -> Solver {
        let ctx = self.ctx();
        let kind = NetworkKind::MossFormer2Sr48k;
        let networks = kind.build(&ctx, &self.config).unwrap();
        let optimizers = kind.optimizers(&networks, &self.config).unwrap();
        let factory = ManifestLoaderFactory::new(&self.config, &ctx.dist);
        let data = build_generators(&self.config, &factory).unwrap();
        Solver::new(self.config.clone(), ctx, networks, optimizers, data, None, cancel).unwrap()
    }
}

/// Every weight of the bundle, in module then variable-name order
pub fn flat_weights(bundle: &NetworkBundle) -> Vec<f32> {
    let mut flat = Vec::new();
    let varmaps = bundle
        .models
        .iter()
        .map(|m| m.varmap())
        .chain(bundle.discriminators.iter().map(|d| d.varmap()));
    for varmap in varmaps {
        let data = varmap.data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            flat.extend(data[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap());
        }
    }
    flat
}
