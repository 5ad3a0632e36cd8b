//! Timestamps reconstructed from a legacy heatmap.
//!
//! Older servers only publish a one byte "heat" per pixel that decays from
//! 255 right after a placement to 0 once the heatmap cooldown has passed,
//! plus a virginmap where 0 marks pixels that were placed at least once.

use crate::ProtocolError;

/// Approximate unix-second timestamps from heatmap and virginmap bytes.
/// A cold pixel decodes to 1 when it was ever placed and 0 otherwise.
pub fn decode_heatmap(
    heatmap: &[u8],
    virginmap: &[u8],
    cooldown_seconds: u32,
    now: u32,
) -> Result<Vec<u32>, ProtocolError> {
    if heatmap.len() != virginmap.len() {
        return Err(ProtocolError::LegacyLength {
            heatmap: heatmap.len(),
            virginmap: virginmap.len(),
        });
    }
    Ok(heatmap
        .iter()
        .zip(virginmap)
        .map(|(heat, virgin)| match heat {
            0 => u32::from(*virgin == 0),
            heat => {
                let age = u64::from(255 - heat) * u64::from(cooldown_seconds) / 255;
                now.saturating_sub(age as u32)
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heat_decays_linearly_over_the_cooldown() {
        let timestamps =
            decode_heatmap(&[255, 0, 0, 51], &[0, 0, 255, 0], 510, 10_000).expect("decode");
        assert_eq!(timestamps, vec![10_000, 1, 0, 10_000 - 408]);
    }

    #[test]
    fn mismatched_maps_are_rejected() {
        assert!(matches!(
            decode_heatmap(&[1, 2], &[0], 10, 10),
            Err(ProtocolError::LegacyLength {
                heatmap: 2,
                virginmap: 1
            })
        ));
    }
}
