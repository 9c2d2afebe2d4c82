//! The aggregation strategy applied to the elements of a window.

use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An incremental aggregation. `merge` has to be associative, so that merging the partial results
/// of the panes of a window, in pane order, gives the same result as adding every element of the
/// window to a single accumulator in arrival order.
pub trait WindowFunction: Send + Sync + 'static {
    type Input: Send + 'static;
    type Accumulator: Send + 'static;
    type Output: Send + 'static;

    /// Creates the identity accumulator, which is also the result of an empty window.
    fn create_accumulator(&self) -> Self::Accumulator;

    /// Adds one element to the accumulator.
    fn add(&self, acc: &mut Self::Accumulator, input: &Self::Input) -> Result<()>;

    /// Merges `other` into `acc`. `other` covers a later interval than `acc`.
    fn merge(&self, acc: &mut Self::Accumulator, other: &Self::Accumulator) -> Result<()>;

    /// Produces the window output from the fully merged accumulator.
    fn finish(&self, acc: Self::Accumulator) -> Result<Self::Output>;
}

/// How a pane stores its contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationMode {
    /// The pane keeps only the running accumulator.
    #[default]
    Aggregating,
    /// The pane keeps the raw elements, they are folded when the window fires.
    Accumulating,
}

impl FromStr for AccumulationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aggregating" => Ok(AccumulationMode::Aggregating),
            "accumulating" => Ok(AccumulationMode::Accumulating),
            other => Err(Error::Config(format!("invalid accumulation mode: {other}"))),
        }
    }
}

impl Display for AccumulationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AccumulationMode::Aggregating => write!(f, "aggregating"),
            AccumulationMode::Accumulating => write!(f, "accumulating"),
        }
    }
}

/// Sums i64 values. The running sum is kept in an i128, so the order in which elements and partial
/// sums are added does not matter, only a window total outside the i64 range is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl WindowFunction for Sum {
    type Input = i64;
    type Accumulator = i128;
    type Output = i64;

    fn create_accumulator(&self) -> i128 {
        0
    }

    fn add(&self, acc: &mut i128, input: &i64) -> Result<()> {
        self.merge(acc, &i128::from(*input))
    }

    fn merge(&self, acc: &mut i128, other: &i128) -> Result<()> {
        *acc = acc
            .checked_add(*other)
            .ok_or_else(|| Error::Aggregate(format!("sum overflow adding {other} to {acc}")))?;
        Ok(())
    }

    fn finish(&self, acc: i128) -> Result<i64> {
        i64::try_from(acc)
            .map_err(|_| Error::Aggregate(format!("window sum {acc} does not fit in an i64")))
    }
}

/// Counts elements, ignoring their value.
#[derive(Debug)]
pub struct Count<T>(PhantomData<fn(T)>);

impl<T> Default for Count<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> WindowFunction for Count<T> {
    type Input = T;
    type Accumulator = u64;
    type Output = u64;

    fn create_accumulator(&self) -> u64 {
        0
    }

    fn add(&self, acc: &mut u64, _input: &T) -> Result<()> {
        *acc += 1;
        Ok(())
    }

    fn merge(&self, acc: &mut u64, other: &u64) -> Result<()> {
        *acc += *other;
        Ok(())
    }

    fn finish(&self, acc: u64) -> Result<u64> {
        Ok(acc)
    }
}

/// Arithmetic mean of i64 values. An empty window has no mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl WindowFunction for Mean {
    type Input = i64;
    type Accumulator = (i128, u64);
    type Output = Option<f64>;

    fn create_accumulator(&self) -> (i128, u64) {
        (0, 0)
    }

    fn add(&self, acc: &mut (i128, u64), input: &i64) -> Result<()> {
        acc.0 += i128::from(*input);
        acc.1 += 1;
        Ok(())
    }

    fn merge(&self, acc: &mut (i128, u64), other: &(i128, u64)) -> Result<()> {
        acc.0 += other.0;
        acc.1 += other.1;
        Ok(())
    }

    fn finish(&self, (sum, count): (i128, u64)) -> Result<Option<f64>> {
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(sum as f64 / count as f64))
    }
}
