//! Panning, distance attenuation and soft clipping

use serde::{Deserialize, Serialize};

use crate::config::MixerConfig;

/// Position in game world units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Stereo gains for one source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoGain {
    pub left: f32,
    pub right: f32,
}

impl StereoGain {
    pub const CENTER: StereoGain = StereoGain {
        left: std::f32::consts::FRAC_1_SQRT_2,
        right: std::f32::consts::FRAC_1_SQRT_2,
    };

    /// Constant-power pan law, `pan` in [-1, 1]
    pub fn from_pan(pan: f32) -> Self {
        let pan = pan.clamp(-1.0, 1.0);
        Self {
            left: ((1.0 - pan) / 2.0).sqrt(),
            right: ((1.0 + pan) / 2.0).sqrt(),
        }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// Pan in [-1, 1]; negative is left of the listener
pub fn pan(listener: Position, source: Position, pan_range: f32) -> f32 {
    ((source.x - listener.x) / pan_range).clamp(-1.0, 1.0)
}

/// Linear falloff with a floor so distant speakers stay audible
pub fn attenuation(listener: Position, source: Position, config: &MixerConfig) -> f32 {
    let distance = (source.x - listener.x).hypot(source.y - listener.y);
    (1.0 - distance / config.max_distance).clamp(config.min_attenuation, 1.0)
}

/// Gains for a source, falling back to centered and unattenuated when
/// spatial audio is off or either position is unknown
pub fn spatial_gain(
    listener: Option<Position>,
    source: Option<Position>,
    spatial: bool,
    config: &MixerConfig,
) -> StereoGain {
    match (spatial, listener, source) {
        (true, Some(listener), Some(source)) => {
            StereoGain::from_pan(pan(listener, source, config.pan_range))
                .scaled(attenuation(listener, source, config))
        }
        _ => StereoGain::CENTER,
    }
}

/// Pass quiet samples through, bend loud ones with `tanh` into the
/// headroom above `threshold`
pub fn soft_clip(sample: i32, threshold: i32) -> i16 {
    let magnitude = sample.unsigned_abs() as i64;
    if magnitude <= threshold as i64 {
        return sample as i16;
    }

    let headroom = (i16::MAX as i32 - threshold) as f32;
    let excess = (magnitude - threshold as i64) as f32 / headroom;
    let bent = threshold as f32 + excess.tanh() * headroom;
    let clipped = bent.round().min(i16::MAX as f32) as i16;
    if sample < 0 {
        -clipped
    } else {
        clipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_pan_is_equal_power() {
        let gain = StereoGain::from_pan(0.0);
        assert!((gain.left - gain.right).abs() < 1e-6);
        assert!((gain.left.powi(2) + gain.right.powi(2) - 1.0).abs() < 1e-6);
        assert_eq!(gain, StereoGain::CENTER);
    }

    #[test]
    fn test_power_constant_across_pan() {
        for step in -10..=10 {
            let gain = StereoGain::from_pan(step as f32 / 10.0);
            assert!((gain.left.powi(2) + gain.right.powi(2) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_source_at_pan_range_is_hard_right() {
        let config = MixerConfig::default();
        let listener = Position::new(0.0, 0.0);
        let source = Position::new(400.0, 0.0);

        assert_eq!(pan(listener, source, config.pan_range), 1.0);
        let gain = StereoGain::from_pan(pan(listener, source, config.pan_range));
        assert!(gain.left.abs() < 1e-6);
        assert!((gain.right - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pan_clamps() {
        let listener = Position::new(0.0, 0.0);
        assert_eq!(pan(listener, Position::new(-5000.0, 0.0), 400.0), -1.0);
        assert_eq!(pan(listener, Position::new(200.0, 900.0), 400.0), 0.5);
    }

    #[test]
    fn test_attenuation_floor() {
        let config = MixerConfig::default();
        let origin = Position::default();
        assert_eq!(attenuation(origin, origin, &config), 1.0);
        let half = Position::new(config.max_distance / 4.0, 0.0);
        assert!((attenuation(origin, half, &config) - 0.75).abs() < 1e-6);
        let far = Position::new(config.max_distance * 3.0, 0.0);
        assert_eq!(attenuation(origin, far, &config), config.min_attenuation);
    }

    #[test]
    fn test_unknown_position_is_centered() {
        let config = MixerConfig::default();
        let source = Some(Position::new(400.0, 0.0));
        assert_eq!(spatial_gain(None, source, true, &config), StereoGain::CENTER);
        assert_eq!(
            spatial_gain(Some(Position::default()), source, false, &config),
            StereoGain::CENTER
        );
    }

    #[test]
    fn test_soft_clip_identity_below_threshold() {
        for x in [-20_000, -12_345, -1, 0, 1, 19_999, 20_000] {
            assert_eq!(soft_clip(x, 20_000) as i32, x);
        }
    }

    #[test]
    fn test_soft_clip_bounds_extreme_input() {
        for x in [20_001, 32_767, 40_000, 200_000, i32::MAX, i32::MIN, -200_000] {
            let y = soft_clip(x, 20_000) as i32;
            assert!(y.abs() <= i16::MAX as i32);
            assert!(y.abs() >= 20_000);
            assert_eq!(y.signum(), x.signum());
        }
    }

    #[test]
    fn test_soft_clip_is_monotonic() {
        let mut previous = soft_clip(19_000, 20_000);
        for x in (19_000..120_000).step_by(500) {
            let y = soft_clip(x, 20_000);
            assert!(y >= previous);
            previous = y;
        }
    }
}
