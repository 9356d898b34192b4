//! Linear token-estimation models.
//!
//! `tokens = multiplier * bytes + constant`, fitted periodically from
//! observed LSM byte counts. The write-amplification instance converts
//! logical bytes into disk-write tokens at admission and again at
//! completion when actual byte counts are known.

/// A fitted linear model from work size to tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokensLinearModel {
    pub multiplier: f64,
    pub constant: i64,
}

impl Default for TokensLinearModel {
    fn default() -> Self {
        // Identity: one token per byte.
        Self {
            multiplier: 1.0,
            constant: 0,
        }
    }
}

impl TokensLinearModel {
    pub fn new(multiplier: f64, constant: i64) -> Self {
        Self {
            multiplier,
            constant,
        }
    }

    /// Apply the model. Zero-byte work pays no constant; negative results
    /// clamp to zero for positive inputs so corrections stay sane.
    pub fn apply(&self, bytes: i64) -> i64 {
        if bytes == 0 {
            return 0;
        }
        let tokens = (self.multiplier * bytes as f64) as i64 + self.constant;
        if bytes > 0 {
            tokens.max(0)
        } else {
            tokens.min(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_default() {
        let m = TokensLinearModel::default();
        assert_eq!(m.apply(100), 100);
        assert_eq!(m.apply(0), 0);
    }

    #[test]
    fn test_amplification() {
        let m = TokensLinearModel::new(10.0, 1);
        assert_eq!(m.apply(50), 501);
    }

    #[test]
    fn test_negative_bytes_for_corrections() {
        let m = TokensLinearModel::new(2.0, 1);
        assert!(m.apply(-100) <= 0);
    }

    #[test]
    fn test_zero_bytes_pays_nothing() {
        let m = TokensLinearModel::new(5.0, 100);
        assert_eq!(m.apply(0), 0);
    }
}
