use std::fmt;

/// How a meter renders its numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    /// Scientific notation with the given precision (`:.4e`).
    Scientific(usize),
    /// Fixed-point with a minimum width and precision (`:6.2f`).
    Fixed { width: usize, precision: usize },
}

impl Default for MeterFormat {
    fn default() -> Self {
        MeterFormat::Fixed {
            width: 0,
            precision: 4,
        }
    }
}

impl MeterFormat {
    fn render(&self, value: f64) -> String {
        match *self {
            MeterFormat::Scientific(precision) => format!("{value:.precision$e}"),
            MeterFormat::Fixed { width, precision } => format!("{value:width$.precision$}"),
        }
    }
}

/// Running mean of a named metric, weighted by sample count.
///
/// Reset at the start of every epoch and read at the end of it.
#[derive(Debug, Clone)]
pub struct AverageMeter {
    pub name: String,
    pub fmt: MeterFormat,
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>, fmt: MeterFormat) -> Self {
        Self {
            name: name.into(),
            fmt,
            val: 0.0,
            sum: 0.0,
            count: 0,
            avg: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0;
        self.avg = 0.0;
    }

    /// Record `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: usize) {
        if n == 0 {
            return;
        }
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        self.avg = self.sum / self.count as f64;
    }
}

impl fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.name,
            self.fmt.render(self.val),
            self.fmt.render(self.avg)
        )
    }
}
