//! Integration checks across the DSP primitives: a decimated FM receive
//! chain built only from `fmtuner` blocks.

use fmtuner::dsp::decimator::IqDecimator;
use fmtuner::dsp::filters::Fir;
use fmtuner::dsp::resampler::RationalResampler;
use fmtuner::{iq_decimation, DSP_RATE};
use num_complex::Complex;

/// Synthesize raw u8 I/Q of an FM carrier modulated by a single tone.
fn fm_bytes(sample_rate: f64, tone_hz: f64, deviation_hz: f64, n: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(n * 2);
    let mut phase = 0.0f64;
    for i in 0..n {
        let t = i as f64 / sample_rate;
        let inst = deviation_hz * (2.0 * std::f64::consts::PI * tone_hz * t).sin();
        phase += 2.0 * std::f64::consts::PI * inst / sample_rate;
        bytes.push((phase.cos() * 100.0 + 127.5).round() as u8);
        bytes.push((phase.sin() * 100.0 + 127.5).round() as u8);
    }
    bytes
}

#[test]
fn decimated_chain_recovers_audio_tone() {
    // 2.048 MS/s tuner stream down to the 256 kHz DSP rate, discriminate,
    // filter, resample to 32 kHz; the 1 kHz modulation must come through.
    let iq_rate = 2_048_000u32;
    let factor = iq_decimation(iq_rate).unwrap();
    assert_eq!(factor, 8);

    let bytes = fm_bytes(iq_rate as f64, 1_000.0, 40_000.0, 262_144);
    let mut decimator = IqDecimator::new(factor);
    let mut decimated = vec![Complex::new(0.0f32, 0.0f32); 32_768];
    let n = decimator.execute(&bytes, &mut decimated);
    assert_eq!(n, 32_768);

    // Quadrature discriminator over the decimated stream
    let mut prev = Complex::new(1.0f32, 0.0);
    let mut demod = Vec::with_capacity(n);
    for &z in &decimated[..n] {
        let d = (z * prev.conj()).arg();
        demod.push(d * DSP_RATE as f32 / (2.0 * std::f32::consts::PI * 75_000.0));
        prev = z;
    }

    let mut audio_filter = Fir::lowpass(15_000.0, 4_000.0, DSP_RATE as f64);
    let filtered = audio_filter.process(&demod);

    let mut resampler = RationalResampler::new(32_000.0 / DSP_RATE as f64);
    let audio = resampler.process(&filtered);
    assert!(audio.len() > 3_000);

    // Tone amplitude: deviation 40 kHz over the 75 kHz scale = 0.533
    let tail = &audio[audio.len() / 2..];
    let rms = (tail.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / tail.len() as f64)
        .sqrt();
    let expected = 40_000.0 / 75_000.0 / std::f64::consts::SQRT_2;
    assert!(
        (rms - expected).abs() < 0.05,
        "audio rms {} expected {}",
        rms,
        expected
    );
}

#[test]
fn rate_validation_matches_supported_ladder() {
    for (rate, factor) in [(256_000u32, 1usize), (1_024_000, 4), (2_048_000, 8)] {
        assert_eq!(iq_decimation(rate).unwrap(), factor);
    }
    for bad in [123_456u32, 44_100, 512_001] {
        assert!(iq_decimation(bad).is_err(), "rate {} must be rejected", bad);
    }
}
