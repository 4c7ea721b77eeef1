//! Feature Aggregator
//!
//! Normalizes one tick of market and sentiment inputs into a fixed-arity vector:
//! - Staleness rejection on the market observation
//! - Bounded imputation of missing sentiment sources
//! - Log-return and log-volume-ratio market features
//!
//! Aggregation is a pure function of its inputs and `now`.

use tracing::debug;

use crate::config::FeatureConfig;
use crate::error::{EngineError, EngineResult};
use crate::utils::helpers::clamp;
use crate::utils::types::{FeatureVector, RawInputs, SentimentReading, TimestampMs};

/// Slot layout: `[log_return, log_volume_ratio, (score, confidence) per source]`
pub struct FeatureAggregator {
    config: FeatureConfig,
}

impl FeatureAggregator {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn arity(&self) -> usize {
        self.config.arity()
    }

    pub fn sources(&self) -> &[String] {
        &self.config.sentiment_sources
    }

    /// Build the feature vector for `symbol` from `raw`, judged at `now`
    pub fn aggregate(
        &self,
        symbol: &str,
        raw: &RawInputs,
        now: TimestampMs,
    ) -> EngineResult<FeatureVector> {
        self.check_market(symbol, raw, now)?;

        let market = &raw.market;
        let mut features = Vec::with_capacity(self.arity());
        features.push((market.price / market.reference_price).ln());
        features.push(((1.0 + market.volume) / (1.0 + market.reference_volume)).ln());

        let mut missing = Vec::new();
        for source in &self.config.sentiment_sources {
            match raw.sentiment.get(source).filter(|r| self.is_usable(r, now)) {
                Some(reading) => {
                    features.push(clamp(reading.score, -1.0, 1.0));
                    features.push(clamp(reading.confidence, 0.0, 1.0));
                }
                None => {
                    missing.push(source.as_str());
                    features.push(self.config.neutral_score);
                    features.push(self.config.neutral_confidence);
                }
            }
        }

        if missing.len() > self.config.max_missing_sources {
            return Err(insufficient(
                symbol,
                format!("missing sentiment sources: {}", missing.join(", ")),
            ));
        }
        if !missing.is_empty() {
            debug!("{}: imputed neutral prior for {:?}", symbol, missing);
        }

        Ok(FeatureVector {
            symbol: symbol.to_string(),
            timestamp: market.timestamp,
            features,
        })
    }

    /// Market-side checks only: symbol, staleness, prices and volumes.
    ///
    /// A failure here is the feed's fault; anything `aggregate` rejects after this
    /// passes comes from the sentiment sources.
    pub fn check_market(&self, symbol: &str, raw: &RawInputs, now: TimestampMs) -> EngineResult<()> {
        if raw.symbol != symbol {
            return Err(insufficient(symbol, format!("inputs belong to {}", raw.symbol)));
        }

        let market = &raw.market;
        let age_ms = (now - market.timestamp).max(0);
        if age_ms > self.config.staleness_ms {
            return Err(EngineError::StaleData {
                symbol: symbol.to_string(),
                age_ms,
                limit_ms: self.config.staleness_ms,
            });
        }

        if !(market.price.is_finite() && market.price > 0.0)
            || !(market.reference_price.is_finite() && market.reference_price > 0.0)
        {
            return Err(insufficient(symbol, "non-positive price"));
        }
        if !(market.volume.is_finite() && market.volume >= 0.0)
            || !(market.reference_volume.is_finite() && market.reference_volume >= 0.0)
        {
            return Err(insufficient(symbol, "invalid volume"));
        }

        Ok(())
    }

    /// Configured sources whose reading in `raw` is absent, stale or non-finite
    pub fn missing_sources<'a>(&'a self, raw: &RawInputs, now: TimestampMs) -> Vec<&'a str> {
        self.config
            .sentiment_sources
            .iter()
            .filter(|source| {
                !raw.sentiment
                    .get(source.as_str())
                    .is_some_and(|r| self.is_usable(r, now))
            })
            .map(String::as_str)
            .collect()
    }

    fn is_usable(&self, reading: &SentimentReading, now: TimestampMs) -> bool {
        reading.score.is_finite()
            && reading.confidence.is_finite()
            && now - reading.timestamp <= self.config.staleness_ms
    }
}

fn insufficient(symbol: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InsufficientData {
        symbol: symbol.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::MarketObservation;
    use std::collections::HashMap;

    fn raw(ts: i64, sources: &[(&str, i64)]) -> RawInputs {
        let mut sentiment = HashMap::new();
        for (name, sts) in sources {
            sentiment.insert(
                name.to_string(),
                SentimentReading { timestamp: *sts, score: 0.4, confidence: 0.8 },
            );
        }
        RawInputs {
            symbol: "BTC".to_string(),
            market: MarketObservation {
                timestamp: ts,
                price: 101.0,
                reference_price: 100.0,
                volume: 10.0,
                reference_volume: 10.0,
            },
            sentiment,
        }
    }

    fn aggregator() -> FeatureAggregator {
        FeatureAggregator::new(FeatureConfig::default())
    }

    #[test]
    fn test_full_inputs_produce_fixed_arity() {
        let fv = aggregator()
            .aggregate("BTC", &raw(1_000, &[("news", 1_000), ("social", 1_000)]), 1_500)
            .unwrap();
        assert_eq!(fv.arity(), 6);
        assert!((fv.features[0] - (1.01f64).ln()).abs() < 1e-12);
        assert_eq!(fv.features[1], 0.0);
        assert_eq!(&fv.features[2..], &[0.4, 0.8, 0.4, 0.8]);
        assert_eq!(fv.timestamp, 1_000);
    }

    #[test]
    fn test_stale_market_rejected() {
        let err = aggregator()
            .aggregate("BTC", &raw(0, &[("news", 0), ("social", 0)]), 60_001)
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleData { age_ms: 60_001, .. }));
    }

    #[test]
    fn test_one_missing_source_imputed() {
        let fv = aggregator()
            .aggregate("BTC", &raw(1_000, &[("news", 1_000)]), 1_000)
            .unwrap();
        assert_eq!(&fv.features[4..], &[0.0, 0.0]);
    }

    #[test]
    fn test_stale_sentiment_counts_as_missing() {
        let news_score = aggregator()
            .aggregate("BTC", &raw(100_000, &[("news", 0), ("social", 100_000)]), 100_000)
            .map(|fv| fv.features[2])
            .unwrap();
        assert_eq!(news_score, 0.0);

        let err = aggregator()
            .aggregate("BTC", &raw(100_000, &[("news", 0)]), 100_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_two_missing_sources_rejected() {
        let err = aggregator().aggregate("BTC", &raw(1_000, &[]), 1_000).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn test_aggregation_is_pure() {
        let inputs = raw(1_000, &[("news", 1_000), ("social", 900)]);
        let a = aggregator().aggregate("BTC", &inputs, 2_000).unwrap();
        let b = aggregator().aggregate("BTC", &inputs, 2_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_market_check_ignores_sentiment() {
        let agg = aggregator();
        let inputs = raw(1_000, &[]);
        assert!(agg.check_market("BTC", &inputs, 1_000).is_ok());
        assert!(agg.aggregate("BTC", &inputs, 1_000).is_err());

        let mut bad = raw(1_000, &[("news", 1_000), ("social", 1_000)]);
        bad.market.price = 0.0;
        assert!(matches!(
            agg.check_market("BTC", &bad, 1_000),
            Err(EngineError::InsufficientData { .. })
        ));
        assert!(matches!(
            agg.check_market("BTC", &raw(0, &[]), 60_001),
            Err(EngineError::StaleData { .. })
        ));
    }

    #[test]
    fn test_missing_sources_reported() {
        let agg = aggregator();
        let inputs = raw(100_000, &[("news", 0), ("social", 100_000)]);
        assert_eq!(agg.missing_sources(&inputs, 100_000), vec!["news"]);
    }
}
