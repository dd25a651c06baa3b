//! Building metrics in the Prometheus text format.

use std::fmt;
use std::fmt::Write;


//------------ Target --------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct Target {
    buf: String,
}

impl Target {
    pub fn into_string(self) -> String {
        self.buf
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn single(&mut self, metric: Metric, value: impl fmt::Display) {
        metric.header(self);
        metric.single(self, value);
    }

    pub fn header(&mut self, metric: Metric) {
        metric.header(self)
    }

    pub fn multi(&mut self, metric: Metric) -> LabelValue<'_> {
        metric.multi(self)
    }

    /// Starts a labelled sample of one of the series of a metric, such as
    /// the `_bucket`, `_sum` and `_count` series of a histogram.
    pub fn series(
        &mut self, metric: Metric, suffix: &str
    ) -> LabelValue<'_> {
        LabelValue::new(metric, suffix, self)
    }
}


//------------ Metric --------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct Metric {
    name: &'static str,
    help: &'static str,
    mtype: MetricType,
}

impl Metric {
    pub fn new(
        name: &'static str, help: &'static str, mtype: MetricType
    ) -> Self {
        Metric { name, help, mtype }
    }

    pub fn counter(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, MetricType::Counter)
    }

    pub fn gauge(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, MetricType::Gauge)
    }

    pub fn histogram(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, MetricType::Histogram)
    }

    fn header(self, target: &mut Target) {
        writeln!(&mut target.buf,
            "# HELP eventd_{} {}\n\
             # TYPE eventd_{} {}",
            self.name, self.help,
            self.name, self.mtype,
        ).expect("writing to string");
    }

    fn single(self, target: &mut Target, value: impl fmt::Display) {
        writeln!(&mut target.buf,
            "eventd_{} {}", self.name, value
        ).expect("writing to string");
    }

    fn multi(self, target: &mut Target) -> LabelValue<'_> {
        LabelValue::new(self, "", target)
    }
}


//------------ LabelValue ----------------------------------------------------

pub struct LabelValue<'a> {
    target: &'a mut Target,
    first: bool,
}

impl<'a> LabelValue<'a> {
    fn new(metric: Metric, suffix: &str, target: &'a mut Target) -> Self {
        write!(
            &mut target.buf, "eventd_{}{suffix}{{", metric.name
        ).expect("writing to string");
        LabelValue { target, first: true }
    }

    pub fn label(mut self, name: &str, value: impl fmt::Display) -> Self {
        if self.first {
            self.first = false;
        }
        else {
            self.target.buf.push_str(", ");
        }
        write!(
            &mut self.target.buf, "{name}=\"{value}\""
        ).expect("writing to string");
        self
    }

    pub fn value(self, value: impl fmt::Display) {
        writeln!(
            &mut self.target.buf, "}} {value}"
        ).expect("writing to string");
    }
}


//------------ MetricType ----------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(
            match *self {
                MetricType::Counter => "counter",
                MetricType::Gauge => "gauge",
                MetricType::Histogram => "histogram",
            }
        )
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_single_and_labelled_metrics() {
        let mut target = Target::default();
        target.single(Metric::gauge("subscriptions", "live subscriptions"), 3);

        let metric = Metric::counter("events", "events per stage");
        target.header(metric);
        target.multi(metric)
            .label("stage", "dispatch")
            .label("status", "ok")
            .value(12);

        assert_eq!(
            target.as_str(),
            "# HELP eventd_subscriptions live subscriptions\n\
             # TYPE eventd_subscriptions gauge\n\
             eventd_subscriptions 3\n\
             # HELP eventd_events events per stage\n\
             # TYPE eventd_events counter\n\
             eventd_events{stage=\"dispatch\", status=\"ok\"} 12\n"
        );
    }
}
