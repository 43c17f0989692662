use std::fmt;

/// Element types a tensor can hold.
///
/// F32 is the workhorse; F16 exists for compressed/half-typed weight reads,
/// F64 for high-precision checks, U8 for masks and packed codes, I64 for
/// index tensors (gather/scatter targets, class labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
    U8,
    I64,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::I64 => 8,
        }
    }

    /// Floating-point types are the only ones that carry gradients.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I64 => "i64",
        };
        write!(f, "{s}")
    }
}

/// Bridge between concrete Rust scalar types and the runtime [`DType`] enum.
///
/// Generic storage code goes through `to_f64`/`from_f64` so one
/// implementation covers every element type; hot paths specialize on the
/// native type instead.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as u8
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn float_classification() {
        assert!(DType::F16.is_float());
        assert!(DType::F16.is_half());
        assert!(DType::F32.is_float());
        assert!(!DType::U8.is_float());
        assert!(!DType::I64.is_float());
    }

    #[test]
    fn f64_roundtrip() {
        assert_eq!(f64::from_f64(2.5).to_f64(), 2.5);
        assert_eq!(i64::from_f64(42.0).to_f64(), 42.0);
        assert_eq!(half::f16::from_f64(1.0).to_f64(), 1.0);
    }
}
