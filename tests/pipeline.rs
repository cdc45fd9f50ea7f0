use ndarray::Array2;
use std::fs;
use std::path::Path;
use xd_svc::audio::{load_wav, write_wav};
use xd_svc::inference::*;
use xd_svc::preprocessing::*;
use xd_svc::training::train;
use xd_svc::HParams;

struct MockEncoder;

impl ContentEncoder for MockEncoder {
    fn encode(&self, audio: &[f32]) -> anyhow::Result<Array2<f32>> {
        Ok(Array2::ones((256, (audio.len() / 320).max(1))))
    }
}

struct MockSynth {
    hop: usize,
}

impl Synthesizer for MockSynth {
    fn synthesize(&self, input: SynthesisInput) -> anyhow::Result<Vec<f32>> {
        assert_eq!(input.content.ncols(), input.f0.len());
        assert_eq!(input.uv.len(), input.f0.len());
        Ok(vec![0.25; input.f0.len() * self.hop])
    }
}

/// Quiet, a tone, then quiet again.
fn recording(sr: u32) -> Vec<f32> {
    let edge = sr as usize / 4;
    let mut audio = vec![0.0; edge];
    audio.extend(
        (0..sr as usize / 2)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sr as f32).sin()),
    );
    audio.resize(audio.len() + edge, 0.0);
    audio
}

fn write_raw_dataset(raw: &Path) {
    for speaker in ["bob", "amy"] {
        fs::create_dir_all(raw.join(speaker)).unwrap();
        for i in 0..6 {
            write_wav(raw.join(speaker).join(format!("{}.wav", i)), &recording(22050), 22050)
                .unwrap();
        }
    }
    fs::write(raw.join("amy/notes.txt"), "not audio").unwrap();
}

#[test]
fn preprocess_train_and_convert() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let raw = root.join("dataset_raw/44k");
    let data = root.join("dataset/44k");
    write_raw_dataset(&raw);

    assert_eq!(preprocess_resample(&raw, &data, 44100, 2).unwrap(), 12);
    let (resampled, sr) = load_wav(data.join("amy/0.wav")).unwrap();
    assert_eq!(sr, 44100);
    // Leading and trailing silence is trimmed
    assert!(resampled.len() < recording(44100).len());

    let lists = root.join("filelists/44k");
    let config = root.join("configs/44k/config.json");
    let hps = preprocess_config(
        &data,
        lists.join("train.txt"),
        lists.join("val.txt"),
        lists.join("test.txt"),
        &config,
    )
    .unwrap();
    assert_eq!(hps.speakers(), vec!["amy", "bob"]);

    assert_eq!(preprocess_hubert_f0(&data, &config, &MockEncoder, false).unwrap(), 12);

    let model_dir = root.join("logs/44k");
    let summary = train(&config, &model_dir, None).unwrap();
    assert_eq!(summary.train_len, 4);
    assert_eq!(summary.val_len, 4);
    assert!(model_dir.join("config.json").is_file());

    let hps = HParams::load(model_dir.join("config.json")).unwrap();
    let hop = hps.data.hop_length;
    let svc = Svc::new(hps, Box::new(MockEncoder), Box::new(MockSynth { hop }));
    let speaker = Speaker::Name("bob".to_string());

    let input = root.join("song.wav");
    let song = recording(44100);
    write_wav(&input, &song, 44100).unwrap();

    let output = default_output_path(&input);
    infer_file(
        &svc,
        &input,
        &output,
        &speaker,
        &InferOptions::default(),
        &SliceOptions::default(),
    )
    .unwrap();
    let (converted, sr) = load_wav(&output).unwrap();
    assert_eq!(sr, 44100);
    assert_eq!(converted.len(), song.len());
    assert_eq!(converted[0], 0.0);
    assert!(converted.iter().any(|x| *x > 0.2));

    let streamed = root.join("song.vc.wav");
    let mut vc = RealtimeVc2::new(&svc, speaker, InferOptions::default(), SliceOptions::default());
    realtime_file(&mut vc, &input, &streamed, 44100, 0.25).unwrap();
    let (streamed, _) = load_wav(&streamed).unwrap();
    assert_eq!(streamed.len(), song.len());
}

#[test]
fn unknown_speaker_id_is_rejected() {
    let mut hps = HParams::template();
    hps.spk.insert("amy".to_string(), 0);
    let svc = Svc::new(hps, Box::new(MockEncoder), Box::new(MockSynth { hop: 512 }));
    let audio = recording(44100);
    assert!(svc
        .infer(&Speaker::Id(3), &audio, &InferOptions::default())
        .is_err());
    assert!(svc
        .infer(&Speaker::Id(0), &audio, &InferOptions::default())
        .is_ok());
}
