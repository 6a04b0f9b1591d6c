//! Query functions
//!
//! Name resolution, signatures and the numeric kernels behind each
//! function. The evaluator feeds them samples; they never touch storage.

use crate::query::value::ValueType;
use crate::storage::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Rate,
    Increase,
    Delta,
    Irate,
    Idelta,
    Changes,
    Resets,
    AvgOverTime,
    SumOverTime,
    MinOverTime,
    MaxOverTime,
    CountOverTime,
    LastOverTime,
    Abs,
    Ceil,
    Floor,
    Round,
    Exp,
    Ln,
    Log2,
    Log10,
    Sqrt,
    ClampMin,
    ClampMax,
    Time,
    Vector,
    Scalar,
    Timestamp,
}

/// Argument and return types of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub args: &'static [ValueType],
    /// Trailing arguments that may be omitted
    pub optional: usize,
    pub returns: ValueType,
}

const MATRIX_TO_VECTOR: Signature = Signature {
    args: &[ValueType::Matrix],
    optional: 0,
    returns: ValueType::Vector,
};

const VECTOR_TO_VECTOR: Signature = Signature {
    args: &[ValueType::Vector],
    optional: 0,
    returns: ValueType::Vector,
};

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name {
            "rate" => Function::Rate,
            "increase" => Function::Increase,
            "delta" => Function::Delta,
            "irate" => Function::Irate,
            "idelta" => Function::Idelta,
            "changes" => Function::Changes,
            "resets" => Function::Resets,
            "avg_over_time" => Function::AvgOverTime,
            "sum_over_time" => Function::SumOverTime,
            "min_over_time" => Function::MinOverTime,
            "max_over_time" => Function::MaxOverTime,
            "count_over_time" => Function::CountOverTime,
            "last_over_time" => Function::LastOverTime,
            "abs" => Function::Abs,
            "ceil" => Function::Ceil,
            "floor" => Function::Floor,
            "round" => Function::Round,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "log2" => Function::Log2,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "clamp_min" => Function::ClampMin,
            "clamp_max" => Function::ClampMax,
            "time" => Function::Time,
            "vector" => Function::Vector,
            "scalar" => Function::Scalar,
            "timestamp" => Function::Timestamp,
            _ => return None,
        };
        Some(func)
    }

    pub fn signature(&self) -> Signature {
        use Function::*;
        match self {
            Rate | Increase | Delta | Irate | Idelta | Changes | Resets | AvgOverTime
            | SumOverTime | MinOverTime | MaxOverTime | CountOverTime | LastOverTime => {
                MATRIX_TO_VECTOR
            }
            Abs | Ceil | Floor | Exp | Ln | Log2 | Log10 | Sqrt | Timestamp => VECTOR_TO_VECTOR,
            Round => Signature {
                args: &[ValueType::Vector, ValueType::Scalar],
                optional: 1,
                returns: ValueType::Vector,
            },
            ClampMin | ClampMax => Signature {
                args: &[ValueType::Vector, ValueType::Scalar],
                optional: 0,
                returns: ValueType::Vector,
            },
            Time => Signature {
                args: &[],
                optional: 0,
                returns: ValueType::Scalar,
            },
            Vector => Signature {
                args: &[ValueType::Scalar],
                optional: 0,
                returns: ValueType::Vector,
            },
            Scalar => Signature {
                args: &[ValueType::Vector],
                optional: 0,
                returns: ValueType::Scalar,
            },
        }
    }

    /// Whether the output keeps the input's metric name
    pub fn keeps_metric_name(&self) -> bool {
        matches!(self, Function::LastOverTime)
    }

    /// Reduce the samples of one range window to a value.
    ///
    /// `window` is the `(start, end]` pair of the selector in milliseconds.
    /// Returns `None` when the window does not hold enough samples.
    pub fn eval_range(&self, samples: &[Sample], window: (i64, i64)) -> Option<f64> {
        let last = samples.last()?;
        match self {
            Function::Rate => extrapolated_rate(samples, window, true, true),
            Function::Increase => extrapolated_rate(samples, window, true, false),
            Function::Delta => extrapolated_rate(samples, window, false, false),
            Function::Irate => instant_delta(samples, true),
            Function::Idelta => instant_delta(samples, false),
            Function::Changes => Some(
                samples
                    .windows(2)
                    .filter(|w| w[0].v != w[1].v && !(w[0].v.is_nan() && w[1].v.is_nan()))
                    .count() as f64,
            ),
            Function::Resets => Some(samples.windows(2).filter(|w| w[1].v < w[0].v).count() as f64),
            Function::AvgOverTime => Some(avg_kahan(samples)),
            Function::SumOverTime => Some(sum_kahan(samples.iter().map(|s| s.v))),
            Function::MinOverTime => Some(samples.iter().fold(f64::NAN, |min, s| {
                if s.v < min || min.is_nan() {
                    s.v
                } else {
                    min
                }
            })),
            Function::MaxOverTime => Some(samples.iter().fold(f64::NAN, |max, s| {
                if s.v > max || max.is_nan() {
                    s.v
                } else {
                    max
                }
            })),
            Function::CountOverTime => Some(samples.len() as f64),
            Function::LastOverTime => Some(last.v),
            _ => None,
        }
    }

    /// Element-wise transform; `arg` is the optional scalar argument
    pub fn eval_math(&self, v: f64, arg: Option<f64>) -> f64 {
        match self {
            Function::Abs => v.abs(),
            Function::Ceil => v.ceil(),
            Function::Floor => v.floor(),
            Function::Round => round_to_nearest(v, arg.unwrap_or(1.0)),
            Function::Exp => v.exp(),
            Function::Ln => v.ln(),
            Function::Log2 => v.log2(),
            Function::Log10 => v.log10(),
            Function::Sqrt => v.sqrt(),
            Function::ClampMin => arg.map_or(v, |min| v.max(min)),
            Function::ClampMax => arg.map_or(v, |max| v.min(max)),
            _ => v,
        }
    }

    pub fn is_range(&self) -> bool {
        self.signature() == MATRIX_TO_VECTOR
    }
}

/// Round half up to the nearest multiple of `to_nearest`
fn round_to_nearest(v: f64, to_nearest: f64) -> f64 {
    // Dividing by the inverse keeps values like 0.1 exact
    let inverse = 1.0 / to_nearest;
    (v * inverse + 0.5).floor() / inverse
}

/// Compensated summation step (Neumaier variant); returns `(sum, compensation)`
#[inline(never)]
fn kahan_inc(inc: f64, sum: f64, c: f64) -> (f64, f64) {
    let t = sum + inc;
    let c = if t.is_infinite() {
        0.0
    } else if sum.abs() >= inc.abs() {
        c + ((sum - t) + inc)
    } else {
        c + ((inc - t) + sum)
    };
    (t, c)
}

pub(crate) fn sum_kahan(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, c) = values
        .into_iter()
        .fold((0.0, 0.0), |(sum, c), v| kahan_inc(v, sum, c));
    sum + c
}

/// Mean that falls back to an incremental form once the running sum overflows
fn avg_kahan(samples: &[Sample]) -> f64 {
    let Some(first) = samples.first() else {
        return f64::NAN;
    };

    let mut sum = first.v;
    let mut c = 0.0;
    let mut mean = 0.0;
    let mut incremental = false;

    for (i, sample) in samples.iter().enumerate().skip(1) {
        let count = (i + 1) as f64;
        if !incremental {
            let (next_sum, next_c) = kahan_inc(sample.v, sum, c);
            if !next_sum.is_infinite() {
                sum = next_sum;
                c = next_c;
                continue;
            }
            incremental = true;
            mean = sum / (count - 1.0);
            c /= count - 1.0;
        }
        let q = (count - 1.0) / count;
        (mean, c) = kahan_inc(sample.v / count, q * mean, q * c);
    }

    if incremental {
        mean + c
    } else {
        let count = samples.len() as f64;
        sum / count + c / count
    }
}

/// `rate`, `increase` and `delta`.
///
/// The raw difference is extrapolated towards the window edges, but never
/// further than 1.1 average sample intervals, and a counter is never
/// extrapolated below zero.
fn extrapolated_rate(
    samples: &[Sample],
    (range_start, range_end): (i64, i64),
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];

    let mut result = last.v - first.v;
    if is_counter {
        for pair in samples.windows(2) {
            if pair[1].v < pair[0].v {
                result += pair[0].v;
            }
        }
    }

    let sampled_interval = (last.t - first.t) as f64 / 1000.0;
    if sampled_interval <= 0.0 {
        return None;
    }
    let average_interval = sampled_interval / (samples.len() - 1) as f64;
    let threshold = average_interval * 1.1;

    let mut to_start = (first.t - range_start) as f64 / 1000.0;
    let to_end = (range_end - last.t) as f64 / 1000.0;

    if is_counter && result > 0.0 && first.v >= 0.0 {
        let to_zero = sampled_interval * (first.v / result);
        if to_zero < to_start {
            to_start = to_zero;
        }
    }

    let mut extrapolated = sampled_interval;
    extrapolated += if to_start < threshold {
        to_start
    } else {
        average_interval / 2.0
    };
    extrapolated += if to_end < threshold {
        to_end
    } else {
        average_interval / 2.0
    };

    let mut value = result * (extrapolated / sampled_interval);
    if is_rate {
        value /= (range_end - range_start) as f64 / 1000.0;
    }
    Some(value)
}

/// `irate` and `idelta` from the last two samples
fn instant_delta(samples: &[Sample], is_rate: bool) -> Option<f64> {
    let [.., previous, last] = samples else {
        return None;
    };

    let delta = if is_rate && last.v < previous.v {
        last.v
    } else {
        last.v - previous.v
    };

    if !is_rate {
        return Some(delta);
    }
    let interval = (last.t - previous.t) as f64 / 1000.0;
    if interval <= 0.0 {
        return None;
    }
    Some(delta / interval)
}
