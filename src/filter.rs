//! Response filter chain (part of C9).
//!
//! Models the design doc's "filter chain as a stateful generator" note: each
//! filter sees response parts as they're produced and may transform or drop
//! them. A filter that panics/errors is identified by its key so the
//! recovery loop in `response.rs` can blacklist it and retry.

use crate::error::CoreError;

/// A chunk of a response body as it flows through the filter chain.
pub type Part = Vec<u8>;

/// A single named filter. Keys are stable strings (matching the driver's and
/// vhost's own filter identifiers) so `bad_filter_keys` can blacklist by
/// name across retries.
pub trait Filter {
    fn key(&self) -> &'static str;

    /// Called once before the first part, letting the filter initialize any
    /// per-response state. Returning `Err` marks this filter bad before any
    /// bytes have been produced, so the response stays `NotStarted` and the
    /// caller can blacklist the filter and retry with a fresh chain.
    fn begin(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Transforms one part. Returning `Err` marks this filter bad for the
    /// rest of the response's lifetime.
    fn apply(&mut self, part: Part) -> Result<Part, CoreError>;

    /// Called once after the last part, giving the filter a chance to emit
    /// trailing bytes (e.g. a compressor's final block).
    fn finish(&mut self) -> Result<Option<Part>, CoreError> {
        Ok(None)
    }
}

/// Composes driver filters and vhost filters, excluding any key present in
/// `bad_filter_keys`, per the design doc's "(driver filters) ∪ (vhost
/// filters) minus bad_filter_keys" rule.
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn compose(
        driver_filters: Vec<Box<dyn Filter>>,
        vhost_filters: Vec<Box<dyn Filter>>,
        bad_filter_keys: &[&str],
    ) -> Self {
        let filters = driver_filters
            .into_iter()
            .chain(vhost_filters)
            .filter(|f| !bad_filter_keys.contains(&f.key()))
            .collect();
        FilterChain { filters }
    }

    /// Seeds every filter in order, per the design doc's "seed the filter
    /// generator" step. Called once before the first `apply`; a filter that
    /// throws here is identified the same way a mid-stream failure is.
    pub fn begin(&mut self) -> Result<(), (&'static str, CoreError)> {
        for filter in &mut self.filters {
            filter.begin().map_err(|e| (filter.key(), e))?;
        }
        Ok(())
    }

    /// Runs one part through every filter in order. On failure, returns the
    /// offending filter's key alongside the error so the caller can add it
    /// to `bad_filter_keys` and retry with a fresh chain.
    pub fn apply(&mut self, mut part: Part) -> Result<Part, (&'static str, CoreError)> {
        for filter in &mut self.filters {
            part = filter.apply(part).map_err(|e| (filter.key(), e))?;
        }
        Ok(part)
    }

    pub fn finish(&mut self) -> Result<Vec<Part>, (&'static str, CoreError)> {
        let mut trailing = Vec::new();
        for filter in &mut self.filters {
            if let Some(part) = filter.finish().map_err(|e| (filter.key(), e))? {
                trailing.push(part);
            }
        }
        Ok(trailing)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;
    impl Filter for Upper {
        fn key(&self) -> &'static str {
            "upper"
        }
        fn apply(&mut self, part: Part) -> Result<Part, CoreError> {
            Ok(part.to_ascii_uppercase())
        }
    }

    struct AlwaysFails;
    impl Filter for AlwaysFails {
        fn key(&self) -> &'static str {
            "boom"
        }
        fn apply(&mut self, _: Part) -> Result<Part, CoreError> {
            Err(CoreError::Application {
                filter_key: Some("boom"),
                message: "nope".into(),
            })
        }
    }

    #[test]
    fn composes_driver_and_vhost_filters_minus_bad_keys() {
        let mut chain = FilterChain::compose(vec![Box::new(Upper)], vec![Box::new(AlwaysFails)], &["boom"]);
        assert!(!chain.is_empty());
        let out = chain.apply(b"hi".to_vec()).unwrap();
        assert_eq!(out, b"HI");
    }

    #[test]
    fn failing_filter_identifies_itself() {
        let mut chain = FilterChain::compose(vec![Box::new(AlwaysFails)], vec![], &[]);
        let err = chain.apply(b"hi".to_vec()).unwrap_err();
        assert_eq!(err.0, "boom");
    }

    struct FailsOnBegin;
    impl Filter for FailsOnBegin {
        fn key(&self) -> &'static str {
            "seed-boom"
        }
        fn begin(&mut self) -> Result<(), CoreError> {
            Err(CoreError::Application {
                filter_key: Some("seed-boom"),
                message: "nope".into(),
            })
        }
        fn apply(&mut self, part: Part) -> Result<Part, CoreError> {
            Ok(part)
        }
    }

    #[test]
    fn begin_identifies_the_failing_filter_before_any_apply() {
        let mut chain = FilterChain::compose(vec![Box::new(FailsOnBegin)], vec![], &[]);
        let err = chain.begin().unwrap_err();
        assert_eq!(err.0, "seed-boom");
    }

    #[test]
    fn begin_runs_every_filter_in_order() {
        let mut chain = FilterChain::compose(vec![Box::new(Upper)], vec![], &[]);
        assert!(chain.begin().is_ok());
    }
}
