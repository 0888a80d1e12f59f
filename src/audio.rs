use anyhow::{Context, Result};
use std::io::Cursor;

/// Duration in seconds read from a WAV header.
pub fn wav_duration_seconds(audio: &[u8]) -> Result<f64> {
    let reader = hound::WavReader::new(Cursor::new(audio)).context("read wav header")?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        anyhow::bail!("wav header reports zero sample rate");
    }
    Ok(reader.duration() as f64 / rate as f64)
}

#[cfg(test)]
pub(crate) fn silent_wav(seconds: f64, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec).unwrap();
        let frames = (seconds * sample_rate as f64) as usize;
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    buf.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_duration_from_header() {
        let wav = silent_wav(1.5, 16_000);
        let secs = wav_duration_seconds(&wav).unwrap();
        assert!((secs - 1.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_wav_bytes() {
        assert!(wav_duration_seconds(b"not a wav file").is_err());
    }
}
