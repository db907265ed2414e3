use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use murmur::audio::parse_wav_bytes;
use murmur::model::{ModelBundle, ModelMetadata};
use murmur::pipeline::Transcriber;

#[derive(Debug, Parser)]
#[command(name = "murmur")]
#[command(about = "Offline speech-to-text transcription", long_about = None)]
struct Args {
    /// Path to a WAV file.
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Read audio from stdin (WAV or raw s16le 24kHz mono).
    #[arg(long, default_value_t = false)]
    stdin: bool,

    /// Model directory with config.json / tokenizer.json / model.safetensors.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Validate model metadata (and optionally weights) without transcribing.
    #[arg(long, default_value_t = false)]
    inspect_model: bool,

    /// When used with --inspect-model, also validate model.safetensors.
    #[arg(long, default_value_t = false)]
    inspect_weights: bool,

    /// Print each token id to stderr as it is emitted.
    #[arg(long, default_value_t = false)]
    trace_tokens: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.inspect_model {
        let model_dir = args
            .model_dir
            .as_ref()
            .context("--inspect-model requires --model-dir")?;
        return inspect_model(model_dir, args.inspect_weights);
    }

    let modes = u32::from(args.audio.is_some()) + u32::from(args.stdin);
    if modes != 1 {
        anyhow::bail!("choose exactly one input mode: --audio or --stdin");
    }

    let model_dir = args.model_dir.as_ref().context("--model-dir is required")?;

    let (samples, sample_rate_hz) = if let Some(path) = &args.audio {
        read_wav_file(path)?
    } else {
        read_stdin_audio()?
    };

    let load_start = Instant::now();
    let bundle = ModelBundle::load_from_dir(model_dir).context("load model")?;
    let transcriber = Transcriber::from_bundle(&bundle).context("assemble transcriber")?;
    eprintln!(
        "model loaded in {:.1}s ({:.1}s of audio at {sample_rate_hz} Hz)",
        load_start.elapsed().as_secs_f32(),
        samples.len() as f32 / sample_rate_hz as f32
    );

    let run_start = Instant::now();
    let text = if args.trace_tokens {
        let mut policy = murmur::sampling::Greedy;
        let mut trace = |id: u32| eprintln!("token {id}");
        transcriber
            .transcribe_with(&samples, sample_rate_hz, &mut policy, Some(&mut trace))
            .context("transcribe")?
    } else {
        transcriber
            .transcribe(&samples, sample_rate_hz)
            .context("transcribe")?
    };
    eprintln!("transcribed in {:.1}s", run_start.elapsed().as_secs_f32());

    println!("{text}");
    Ok(())
}

fn inspect_model(model_dir: &PathBuf, inspect_weights: bool) -> Result<()> {
    let meta = ModelMetadata::load_from_dir(model_dir).context("load model metadata")?;
    eprintln!(
        "model ok: encoder_dim={} encoder_layers={} decoder_dim={} decoder_layers={} vocab_size={} max_tokens={}",
        meta.params.encoder.dim,
        meta.params.encoder.n_layers,
        meta.params.decoder.dim,
        meta.params.decoder.n_layers,
        meta.params.decoder.vocab_size,
        meta.params.decoder.max_tokens,
    );

    if inspect_weights {
        let bundle =
            ModelBundle::load_from_dir(model_dir).context("load model bundle with weights")?;
        let names = bundle.weights.names().context("list tensor names")?;
        eprintln!("weights ok: tensor_count={}", names.len());
    }
    Ok(())
}

fn read_wav_file(path: &PathBuf) -> Result<(Vec<f32>, u32)> {
    let bytes = std::fs::read(path).with_context(|| format!("read file {path:?}"))?;
    let wav = parse_wav_bytes(&bytes).context("parse wav")?;
    Ok((wav.samples_mono, wav.sample_rate_hz))
}

fn read_stdin_audio() -> Result<(Vec<f32>, u32)> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("read stdin")?;

    if buf.len() >= 12 && &buf[0..4] == b"RIFF" && &buf[8..12] == b"WAVE" {
        let wav = parse_wav_bytes(&buf).context("parse wav")?;
        Ok((wav.samples_mono, wav.sample_rate_hz))
    } else {
        // raw s16le mono at the 24 kHz system boundary rate
        if buf.len() % 2 != 0 {
            buf.pop();
        }
        let mut out = Vec::with_capacity(buf.len() / 2);
        for b in buf.chunks_exact(2) {
            let s = i16::from_le_bytes([b[0], b[1]]);
            out.push((s as f32) / 32768.0);
        }
        Ok((out, murmur::constants::INPUT_SAMPLE_RATE_HZ))
    }
}
