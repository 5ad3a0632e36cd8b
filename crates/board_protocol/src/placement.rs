use serde::{Deserialize, Serialize};

/// A single pixel as last placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub position: u64,
    pub color: u32,
    /// Seconds since the board's `created_at`.
    pub modified: u32,
}

/// Server answer to a successful placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementReceipt {
    #[serde(flatten)]
    pub placement: Placement,
    /// Unix seconds until which the placement may still be undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_deadline: Option<u64>,
}

/// Checks a privileged user asks the server to skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceOverrides {
    pub cooldown: bool,
    pub color: bool,
    pub mask: bool,
}

impl PlaceOverrides {
    pub const NONE: Self = Self {
        cooldown: false,
        color: false,
        mask: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_flattens_placement_fields() {
        let receipt: PlacementReceipt = serde_json::from_str(
            r#"{ "position": 12, "color": 3, "modified": 40, "undo_deadline": 1700000030 }"#,
        )
        .expect("parse receipt");
        assert_eq!(
            receipt.placement,
            Placement {
                position: 12,
                color: 3,
                modified: 40
            }
        );
        assert_eq!(receipt.undo_deadline, Some(1_700_000_030));

        let receipt: PlacementReceipt =
            serde_json::from_str(r#"{ "position": 1, "color": 0, "modified": 0 }"#)
                .expect("parse receipt");
        assert_eq!(receipt.undo_deadline, None);
    }

    #[test]
    fn overrides_default_to_none() {
        let overrides: PlaceOverrides =
            serde_json::from_str(r#"{ "mask": true }"#).expect("parse overrides");
        assert!(overrides.mask);
        assert!(!overrides.cooldown);
        assert_eq!(PlaceOverrides::default(), PlaceOverrides::NONE);
    }
}
