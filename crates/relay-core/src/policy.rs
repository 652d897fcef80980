//! Resource ceilings for the relay
//!
//! A [`LimitPolicy`] is supplied once at startup and never changes. Every
//! dimension is a [`Limit`], which is either a concrete ceiling or
//! [`Limit::Unbounded`]. Unbounded dimensions are never enforced.
//!
//! In TOML every field accepts either a number or the string `"unbounded"`;
//! durations are written in seconds:
//!
//! ```toml
//! max_reservations = 128
//! max_circuits_per_reservation = 16
//! max_circuits = "unbounded"
//! reservation_ttl = 3600
//! max_circuit_duration = 120
//! max_circuit_bytes = 131072
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Sentinel spelling of an unbounded limit in configuration files
pub const UNBOUNDED: &str = "unbounded";

/// A ceiling on one resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit<T> {
    /// No ceiling is enforced
    Unbounded,
    /// Values must stay within this ceiling
    Max(T),
}

impl<T: Copy + Ord> Limit<T> {
    /// The ceiling, if any
    #[must_use]
    pub fn get(self) -> Option<T> {
        match self {
            Limit::Unbounded => None,
            Limit::Max(v) => Some(v),
        }
    }

    /// True if no ceiling is enforced
    #[must_use]
    pub fn is_unbounded(self) -> bool {
        matches!(self, Limit::Unbounded)
    }

    /// The tighter of two limits
    #[must_use]
    pub fn min(self, other: Limit<T>) -> Limit<T> {
        match (self, other) {
            (Limit::Unbounded, other) => other,
            (this, Limit::Unbounded) => this,
            (Limit::Max(a), Limit::Max(b)) => Limit::Max(a.min(b)),
        }
    }
}

impl Limit<usize> {
    /// True if one more unit may be admitted while `current` are in use
    #[must_use]
    pub fn permits(self, current: usize) -> bool {
        match self {
            Limit::Unbounded => true,
            Limit::Max(max) => current < max,
        }
    }
}

impl<T> From<Option<T>> for Limit<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Limit::Unbounded, Limit::Max)
    }
}

impl<T: Serialize> Serialize for Limit<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Unbounded => serializer.serialize_str(UNBOUNDED),
            Limit::Max(v) => v.serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LimitRepr<T> {
    Max(T),
    Word(String),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Limit<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match LimitRepr::<T>::deserialize(deserializer)? {
            LimitRepr::Max(v) => Ok(Limit::Max(v)),
            LimitRepr::Word(w) if w.eq_ignore_ascii_case(UNBOUNDED) => Ok(Limit::Unbounded),
            LimitRepr::Word(w) => Err(D::Error::custom(format!(
                "expected a number or \"{UNBOUNDED}\", got {w:?}"
            ))),
        }
    }
}

/// Serde adapter writing `Limit<Duration>` as whole seconds
mod limit_secs {
    use super::Limit;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        limit: &Limit<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        limit
            .get()
            .map_or(Limit::Unbounded, |d| Limit::Max(d.as_secs()))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Limit<Duration>, D::Error> {
        Ok(Limit::<u64>::deserialize(deserializer)?
            .get()
            .map(Duration::from_secs)
            .into())
    }
}

/// Per-circuit limits, either requested by a peer or in effect for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitLimits {
    /// Maximum lifetime of the circuit
    pub duration: Limit<Duration>,
    /// Maximum bytes relayed across both directions
    pub bytes: Limit<u64>,
}

impl CircuitLimits {
    /// No preference; the policy caps apply as-is
    pub const UNBOUNDED: CircuitLimits = CircuitLimits {
        duration: Limit::Unbounded,
        bytes: Limit::Unbounded,
    };
}

impl Default for CircuitLimits {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// Invalid policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// A dimension was bounded at zero, so nothing could ever be admitted
    #[error("{0} must be non-zero (use \"unbounded\" to disable the limit)")]
    Zero(&'static str),
}

/// Immutable snapshot of the relay's resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitPolicy {
    /// Maximum number of live reservations
    pub max_reservations: Limit<usize>,
    /// Maximum open circuits towards a single reserved peer
    pub max_circuits_per_reservation: Limit<usize>,
    /// Maximum open circuits across the relay
    pub max_circuits: Limit<usize>,
    /// How long a reservation stays live after being granted or renewed
    #[serde(with = "limit_secs")]
    pub reservation_ttl: Limit<Duration>,
    /// Hard cap on circuit lifetime
    #[serde(with = "limit_secs")]
    pub max_circuit_duration: Limit<Duration>,
    /// Hard cap on bytes relayed per circuit
    pub max_circuit_bytes: Limit<u64>,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            max_reservations: Limit::Max(128),
            max_circuits_per_reservation: Limit::Max(16),
            max_circuits: Limit::Max(1024),
            reservation_ttl: Limit::Max(Duration::from_secs(60 * 60)),
            max_circuit_duration: Limit::Max(Duration::from_secs(2 * 60)),
            max_circuit_bytes: Limit::Max(1 << 17),
        }
    }
}

impl LimitPolicy {
    /// A policy that enforces no ceiling at all
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_reservations: Limit::Unbounded,
            max_circuits_per_reservation: Limit::Unbounded,
            max_circuits: Limit::Unbounded,
            reservation_ttl: Limit::Unbounded,
            max_circuit_duration: Limit::Unbounded,
            max_circuit_bytes: Limit::Unbounded,
        }
    }

    /// Effective limits for a circuit: the requested value per dimension,
    /// never above the policy cap
    #[must_use]
    pub fn effective_circuit_limits(&self, requested: CircuitLimits) -> CircuitLimits {
        CircuitLimits {
            duration: self.max_circuit_duration.min(requested.duration),
            bytes: self.max_circuit_bytes.min(requested.bytes),
        }
    }

    /// The caps granted to a reserving peer for circuits towards it
    #[must_use]
    pub fn circuit_caps(&self) -> CircuitLimits {
        self.effective_circuit_limits(CircuitLimits::UNBOUNDED)
    }

    /// Check that every bounded dimension can admit something
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Zero`] naming the first dimension bounded at zero.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_reservations == Limit::Max(0) {
            return Err(PolicyError::Zero("max_reservations"));
        }
        if self.max_circuits_per_reservation == Limit::Max(0) {
            return Err(PolicyError::Zero("max_circuits_per_reservation"));
        }
        if self.max_circuits == Limit::Max(0) {
            return Err(PolicyError::Zero("max_circuits"));
        }
        if self.reservation_ttl == Limit::Max(Duration::ZERO) {
            return Err(PolicyError::Zero("reservation_ttl"));
        }
        if self.max_circuit_duration == Limit::Max(Duration::ZERO) {
            return Err(PolicyError::Zero("max_circuit_duration"));
        }
        if self.max_circuit_bytes == Limit::Max(0) {
            return Err(PolicyError::Zero("max_circuit_bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_min() {
        assert_eq!(Limit::<u64>::Unbounded.min(Limit::Unbounded), Limit::Unbounded);
        assert_eq!(Limit::Unbounded.min(Limit::Max(5u64)), Limit::Max(5));
        assert_eq!(Limit::Max(5u64).min(Limit::Unbounded), Limit::Max(5));
        assert_eq!(Limit::Max(5u64).min(Limit::Max(3)), Limit::Max(3));
    }

    #[test]
    fn test_limit_permits() {
        assert!(Limit::Max(2).permits(1));
        assert!(!Limit::Max(2).permits(2));
        assert!(Limit::Unbounded.permits(usize::MAX));
    }

    #[test]
    fn test_effective_limits_never_exceed_cap() {
        let policy = LimitPolicy {
            max_circuit_bytes: Limit::Max(1000),
            max_circuit_duration: Limit::Max(Duration::from_secs(60)),
            ..LimitPolicy::default()
        };

        let generous = CircuitLimits {
            duration: Limit::Max(Duration::from_secs(600)),
            bytes: Limit::Max(1_000_000),
        };
        let effective = policy.effective_circuit_limits(generous);
        assert_eq!(effective.bytes, Limit::Max(1000));
        assert_eq!(effective.duration, Limit::Max(Duration::from_secs(60)));

        let modest = CircuitLimits {
            duration: Limit::Max(Duration::from_secs(5)),
            bytes: Limit::Max(10),
        };
        assert_eq!(policy.effective_circuit_limits(modest), modest);

        assert_eq!(
            policy.effective_circuit_limits(CircuitLimits::UNBOUNDED),
            policy.circuit_caps()
        );
    }

    #[test]
    fn test_validate() {
        assert!(LimitPolicy::default().validate().is_ok());
        assert!(LimitPolicy::unbounded().validate().is_ok());

        let policy = LimitPolicy {
            max_circuits: Limit::Max(0),
            ..LimitPolicy::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::Zero("max_circuits")));
    }

    #[test]
    fn test_toml_policy() {
        let policy: LimitPolicy = toml::from_str(
            r#"
            max_reservations = 1
            max_circuits = "unbounded"
            reservation_ttl = 30
            max_circuit_bytes = "Unbounded"
            "#,
        )
        .unwrap();

        assert_eq!(policy.max_reservations, Limit::Max(1));
        assert_eq!(policy.max_circuits, Limit::Unbounded);
        assert_eq!(policy.reservation_ttl, Limit::Max(Duration::from_secs(30)));
        assert_eq!(policy.max_circuit_bytes, Limit::Unbounded);
        // Unspecified fields keep their defaults
        assert_eq!(
            policy.max_circuits_per_reservation,
            LimitPolicy::default().max_circuits_per_reservation
        );
    }

    #[test]
    fn test_toml_rejects_unknown_word() {
        let result: Result<LimitPolicy, _> = toml::from_str("max_circuits = \"lots\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_serialization() {
        let policy = LimitPolicy::unbounded();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"max_reservations\":\"unbounded\""));

        let back: LimitPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
