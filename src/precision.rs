//! Working precisions and the one-way escalation between them.
//!
//! Every numeric type in the pipeline is generic over [`Precision`].  The two
//! optimisation stages are monomorphised separately, so a stage-A value can
//! only reach stage B through [`Widen`], which exists for non-narrowing pairs
//! only.  Mixing precisions inside one computation is a type error.

use num_traits::Float;
use serde::Deserialize;
use std::fmt::{self, Debug, Display, LowerExp};
use std::str::FromStr;

/// Floating-point type a pipeline stage computes in.
pub trait Precision:
    Float + Debug + Display + LowerExp + Default + Send + Sync + 'static
{
    /// Runtime tag of this precision.
    const KIND: PrecisionKind;

    /// Round an `f64` literal or configuration value into this precision.
    fn lit(value: f64) -> Self;

    /// Exact conversion to `f64` for reporting.
    fn as_f64(self) -> f64;
}

macro_rules! impl_precision {
    ($t:ty, $kind:expr) => {
        impl Precision for $t {
            const KIND: PrecisionKind = $kind;

            #[inline]
            fn lit(value: f64) -> Self {
                value as $t
            }

            #[inline]
            fn as_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_precision!(f32, PrecisionKind::Single);
impl_precision!(f64, PrecisionKind::Double);

/// Lossless cast from `Self` into a precision at least as wide.
///
/// There is deliberately no `Widen<f32> for f64`.
pub trait Widen<T: Precision>: Precision {
    fn widen(self) -> T;
}

impl Widen<f32> for f32 {
    #[inline]
    fn widen(self) -> f32 {
        self
    }
}

impl Widen<f64> for f32 {
    #[inline]
    fn widen(self) -> f64 {
        f64::from(self)
    }
}

impl Widen<f64> for f64 {
    #[inline]
    fn widen(self) -> f64 {
        self
    }
}

/// Runtime selector for a working precision (configuration / CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecisionKind {
    /// IEEE-754 binary32.
    Single,
    /// IEEE-754 binary64.
    #[default]
    Double,
}

impl PrecisionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Self::Single => 32,
            Self::Double => 64,
        }
    }
}

impl Display for PrecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for PrecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "f32" => Ok(Self::Single),
            "double" | "f64" => Ok(Self::Double),
            other => Err(format!("unknown precision `{other}` (expected single or double)")),
        }
    }
}
