//! Synthetic audio payloads.
//!
//! Chunks are little-endian PCM16 mono: a voiced tone with one harmonic,
//! mixed with white noise according to the traffic profile. The endpoint
//! treats them as opaque bytes; the shape only matters for servers that run
//! real speech processing.

use bytes::{BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use std::f32::consts::TAU;
use std::time::Duration;
use voxload_core::{CoreError, CoreResult, SessionConfig, TrafficProfile};

/// Picks a traffic profile with probability proportional to its weight.
pub fn choose_profile<'a, R: Rng + ?Sized>(
    profiles: &'a [TrafficProfile],
    rng: &mut R,
) -> CoreResult<&'a TrafficProfile> {
    profiles
        .choose_weighted(rng, |profile| profile.weight)
        .map_err(|e| CoreError::invalid_state(format!("cannot choose traffic profile: {}", e)))
}

/// Draws a session duration uniformly from the configured range.
pub fn session_duration<R: Rng + ?Sized>(config: &SessionConfig, rng: &mut R) -> Duration {
    let min = config.min_duration_ms.min(config.max_duration_ms);
    Duration::from_millis(rng.gen_range(min..=config.max_duration_ms))
}

/// Synthesizes one chunk of `chunk_size` bytes for `profile`.
///
/// An odd trailing byte is zero padding.
pub fn synthesize_chunk<R: Rng + ?Sized>(
    profile: &TrafficProfile,
    chunk_size: usize,
    rng: &mut R,
) -> Bytes {
    let samples = chunk_size / 2;
    let sample_rate = profile.sample_rate_hz.max(1) as f32;
    let noise = profile.noise_ratio.clamp(0.0, 1.0);
    let amplitude = profile.amplitude.clamp(0.0, 1.0);

    let mut buf = BytesMut::with_capacity(chunk_size);
    for i in 0..samples {
        let t = i as f32 / sample_rate;
        let phase = TAU * profile.base_frequency_hz * t;
        let voiced = (phase.sin() + 0.5 * (2.0 * phase).sin()) / 1.5;
        let mixed = (1.0 - noise) * voiced + noise * rng.gen_range(-1.0f32..=1.0);
        let sample = (amplitude * mixed).clamp(-1.0, 1.0) * f32::from(i16::MAX);
        buf.put_i16_le(sample as i16);
    }
    if chunk_size % 2 == 1 {
        buf.put_u8(0);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_chunk_has_requested_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let profile = TrafficProfile::new("stockholm", 180.0, 0.6, 0.05);

        assert_eq!(synthesize_chunk(&profile, 3200, &mut rng).len(), 3200);
        assert_eq!(synthesize_chunk(&profile, 33, &mut rng).len(), 33);
    }

    #[test]
    fn test_amplitude_bounds_samples() {
        let mut rng = StdRng::seed_from_u64(7);
        let profile = TrafficProfile::new("quiet", 200.0, 0.25, 0.0);
        let chunk = synthesize_chunk(&profile, 3200, &mut rng);

        let limit = (0.25 * f32::from(i16::MAX)) as i16 + 1;
        for pair in chunk.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            assert!(sample.abs() <= limit, "sample {} exceeds {}", sample, limit);
        }
    }

    #[test]
    fn test_choose_profile_respects_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut heavy = TrafficProfile::new("heavy", 180.0, 0.6, 0.05);
        heavy.weight = 9.0;
        let light = TrafficProfile::new("light", 210.0, 0.5, 0.05);
        let profiles = vec![heavy, light];

        let heavy_picks = (0..1000)
            .filter(|_| choose_profile(&profiles, &mut rng).unwrap().name == "heavy")
            .count();
        assert!(heavy_picks > 800, "heavy picked {} times", heavy_picks);
    }

    #[test]
    fn test_choose_profile_empty_is_error() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(choose_profile(&[], &mut rng).is_err());
    }

    #[test]
    fn test_session_duration_within_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = SessionConfig {
            min_duration_ms: 1_000,
            max_duration_ms: 2_000,
            ..Default::default()
        };
        for _ in 0..100 {
            let duration = session_duration(&config, &mut rng);
            assert!(duration >= Duration::from_millis(1_000));
            assert!(duration <= Duration::from_millis(2_000));
        }
    }
}
