//! Signed 24.8 fixed point numbers, the `f` argument type.

#![allow(clippy::cast_precision_loss)]

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// A signed fixed point number with 8 bits of fractional precision.
///
/// Conversions from floating point round to the nearest 1/256, so a value survives
/// a trip over the wire with an error of at most half a unit in the last place.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Fixed(i32);

impl Fixed {
    /// One unit, `1.0`.
    pub const ONE: Self = Self(256);
    /// The smallest representable step, `1/256`.
    pub const EPSILON: Self = Self(1);

    /// Wraps the raw 32 bit word as sent on the wire.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32 bit word as sent on the wire.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    /// Converts an integer, saturating at the representable range.
    #[must_use]
    pub const fn from_int(value: i32) -> Self {
        Self(value.saturating_mul(256))
    }

    /// Returns the value as a double.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }

    /// Returns the integer part, rounded toward zero.
    #[must_use]
    pub const fn trunc(self) -> i32 {
        self.0 / 256
    }

    /// Returns the absolute value. The most negative value maps to itself.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.wrapping_abs())
    }
}

impl std::fmt::Display for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

macro_rules! fixed_op {
    ($op:ident, $method:ident, $assign:ident, $assign_method:ident, |$a:ident, $b:ident| $body:expr) => {
        impl $op for Fixed {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self::Output {
                let ($a, $b) = (self.0, rhs.0);
                Fixed($body)
            }
        }
        impl $assign for Fixed {
            fn $assign_method(&mut self, rhs: Self) {
                *self = $op::$method(*self, rhs);
            }
        }
    };
}

fixed_op!(Add, add, AddAssign, add_assign, |a, b| a.wrapping_add(b));
fixed_op!(Sub, sub, SubAssign, sub_assign, |a, b| a.wrapping_sub(b));
fixed_op!(Mul, mul, MulAssign, mul_assign, |a, b| ((i64::from(a) * i64::from(b)) >> 8) as i32);
fixed_op!(Div, div, DivAssign, div_assign, |a, b| ((i64::from(a) << 8) / i64::from(b)) as i32);

impl Neg for Fixed {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Fixed(self.0.wrapping_neg())
    }
}

impl<T: num_traits::AsPrimitive<f64>> From<T> for Fixed {
    fn from(value: T) -> Self {
        Fixed((value.as_() * 256.0).round() as i32)
    }
}

impl From<Fixed> for f64 {
    fn from(value: Fixed) -> Self {
        value.to_f64()
    }
}

impl From<Fixed> for f32 {
    fn from(value: Fixed) -> Self {
        value.0 as f32 / 256.0
    }
}

impl From<Fixed> for i32 {
    fn from(value: Fixed) -> Self {
        value.trunc()
    }
}

impl From<Fixed> for i64 {
    fn from(value: Fixed) -> Self {
        i64::from(value.trunc())
    }
}
