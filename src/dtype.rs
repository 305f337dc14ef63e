use std::fmt;

use crate::{Error, Result};

/// Scalar element kinds known to the conversion dispatch.
///
/// `Custom` carries an element size in bytes for ports whose payload the
/// runtime treats as opaque; custom elements cannot be converted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Custom(u32),
}

impl Scalar {
    pub fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::I64 | Scalar::U64 | Scalar::F64 => 8,
            Scalar::Custom(size) => size as usize,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Scalar::I8 => "int8",
            Scalar::I16 => "int16",
            Scalar::I32 => "int32",
            Scalar::I64 => "int64",
            Scalar::U8 => "uint8",
            Scalar::U16 => "uint16",
            Scalar::U32 => "uint32",
            Scalar::U64 => "uint64",
            Scalar::F32 => "float32",
            Scalar::F64 => "float64",
            Scalar::Custom(_) => "custom",
        }
    }
}

/// An element-type tag: a scalar kind, optionally paired into a complex
/// (re, im) element. The runtime only ever inspects the size; the tag
/// exists so edges can check compatibility and conversions can dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dtype {
    scalar: Scalar,
    complex: bool,
}

impl Dtype {
    pub const fn new(scalar: Scalar) -> Dtype {
        Dtype {
            scalar,
            complex: false,
        }
    }

    /// A complex pairing of `scalar`. Custom scalars cannot be paired.
    pub fn complex(scalar: Scalar) -> Result<Dtype> {
        if let Scalar::Custom(_) = scalar {
            return Err(Error::invalid_argument("custom elements cannot be complex"));
        }
        Ok(Dtype {
            scalar,
            complex: true,
        })
    }

    pub fn scalar(&self) -> Scalar {
        self.scalar
    }

    pub fn is_complex(&self) -> bool {
        self.complex
    }

    /// Element size in bytes.
    pub fn size(&self) -> usize {
        self.scalar.size() * if self.complex { 2 } else { 1 }
    }

    /// Parse a name such as `"float32"` or `"complex_int16"`.
    pub fn parse(name: &str) -> Result<Dtype> {
        let (rest, complex) = match name.strip_prefix("complex_") {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let scalar = match rest {
            "int8" => Scalar::I8,
            "int16" => Scalar::I16,
            "int32" => Scalar::I32,
            "int64" => Scalar::I64,
            "uint8" => Scalar::U8,
            "uint16" => Scalar::U16,
            "uint32" => Scalar::U32,
            "uint64" => Scalar::U64,
            "float32" => Scalar::F32,
            "float64" => Scalar::F64,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown element type \"{}\"",
                    other
                )))
            }
        };
        if complex {
            Dtype::complex(scalar)
        } else {
            Ok(Dtype::new(scalar))
        }
    }
}

impl Default for Dtype {
    fn default() -> Dtype {
        Dtype::new(Scalar::U8)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.complex {
            write!(f, "complex_{}", self.scalar.name())
        } else {
            f.write_str(self.scalar.name())
        }
    }
}
