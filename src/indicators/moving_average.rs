use std::collections::VecDeque;

/// Simple Moving Average over a fixed window of samples
///
/// Keeps the last `period` values and their running sum, so each update is
/// O(1).
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    /// Push a sample and return the average if the window is full
    pub fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.sum += value;

        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }

        self.value()
    }

    /// Current average, `None` until `period` samples have been seen
    pub fn value(&self) -> Option<f64> {
        if self.period == 0 || self.window.len() < self.period {
            return None;
        }
        Some(self.sum / self.period as f64)
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

/// Exponential Moving Average
///
/// Seeds from the first sample exactly, then applies
/// `ema = price * k + ema * (1 - k)` with `k = 2 / (span + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    span: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        Self { span, value: None }
    }

    pub fn multiplier(&self) -> f64 {
        2.0 / (self.span as f64 + 1.0)
    }

    pub fn update(&mut self, price: f64) -> f64 {
        let k = self.multiplier();
        let next = match self.value {
            None => price,
            Some(prev) => price * k + prev * (1.0 - k),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
