//! Benchmarks for performance-critical paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::sync::Arc;

use adaptive_strategy_engine::config::{FeatureConfig, ModelConfig, PolicyConfig};
use adaptive_strategy_engine::features::FeatureAggregator;
use adaptive_strategy_engine::model::{
    CancelToken, ForecastModel, ModelParameters, ModelRegistry, ModelTrainer, ModelVersion, RidgeTrainer,
    TrainingSample,
};
use adaptive_strategy_engine::policy::{decide_portfolio, Candidate};
use adaptive_strategy_engine::utils::types::{
    FeatureVector, ForecastRecord, HealthState, MarketObservation, PositionState, RawInputs, SentimentReading,
};

fn raw_inputs(ts: i64) -> RawInputs {
    let mut sentiment = HashMap::new();
    sentiment.insert("news".to_string(), SentimentReading { timestamp: ts, score: 0.3, confidence: 0.9 });
    sentiment.insert("social".to_string(), SentimentReading { timestamp: ts, score: -0.1, confidence: 0.5 });
    RawInputs {
        symbol: "BTC".to_string(),
        market: MarketObservation {
            timestamp: ts,
            price: 101.5,
            reference_price: 100.0,
            volume: 1_200.0,
            reference_volume: 1_000.0,
        },
        sentiment,
    }
}

/// Benchmark feature aggregation with one imputed source
fn bench_aggregate(c: &mut Criterion) {
    let aggregator = FeatureAggregator::new(FeatureConfig::default());
    let full = raw_inputs(10_000);
    let mut partial = full.clone();
    partial.sentiment.remove("social");

    c.bench_function("aggregate_full", |b| {
        b.iter(|| black_box(aggregator.aggregate("BTC", black_box(&full), 10_500)))
    });
    c.bench_function("aggregate_imputed", |b| {
        b.iter(|| black_box(aggregator.aggregate("BTC", black_box(&partial), 10_500)))
    });
}

/// Benchmark prediction against a full window
fn bench_predict(c: &mut Criterion) {
    let arity = FeatureConfig::default().arity();
    let config = ModelConfig::default();
    let model = ForecastModel::new(config.clone(), arity, Arc::new(ModelRegistry::new()));
    let weights: Vec<f64> = (0..1 + 2 * arity).map(|i| 0.001 * i as f64).collect();
    let version = Arc::new(ModelVersion {
        id: 1,
        parameters: ModelParameters { arity, weights, residual_std: 0.01 },
        training_window: None,
        validation_score: None,
        created_at: 0,
        trainer: "bench".to_string(),
    });
    if model.load_version(version).is_err() {
        return;
    }

    for ts in 0..config.window_capacity as i64 {
        let features = (0..arity).map(|i| ((ts + i as i64) as f64 * 0.37).sin()).collect();
        model.observe(FeatureVector { symbol: "BTC".to_string(), timestamp: ts, features });
    }

    c.bench_function("predict_symbol", |b| {
        b.iter(|| black_box(model.predict_symbol(black_box("BTC"), config.default_horizon_ms)))
    });
}

fn candidates(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| {
            let symbol = format!("SYM{:03}", i);
            Candidate {
                forecast: Some(ForecastRecord {
                    id: uuid::Uuid::new_v4(),
                    symbol: symbol.clone(),
                    issued_at: 0,
                    horizon_ms: 60_000,
                    predicted_return: ((i as f64) * 0.61).sin() * 0.01,
                    uncertainty: 0.01 + (i % 7) as f64 * 0.002,
                    model_version: 1,
                    inputs: Vec::new(),
                }),
                position: PositionState::flat(symbol),
                input_health: HealthState::Healthy,
            }
        })
        .collect()
}

/// Benchmark portfolio decisions at different universe sizes
fn bench_decide_portfolio(c: &mut Criterion) {
    let config = PolicyConfig::default();
    let mut group = c.benchmark_group("decide_portfolio");

    for size in [10, 100, 1000].iter() {
        let batch = candidates(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| black_box(decide_portfolio(black_box(batch), &config)))
        });
    }

    group.finish();
}

/// Benchmark ridge fits over growing training sets
fn bench_ridge_fit(c: &mut Criterion) {
    let dim = 1 + 2 * FeatureConfig::default().arity();
    let trainer = RidgeTrainer::new(1e-3);
    let mut group = c.benchmark_group("ridge_fit");

    for size in [50, 500, 2000].iter() {
        let samples: Vec<TrainingSample> = (0..*size)
            .map(|i| {
                let mut inputs = vec![1.0];
                inputs.extend((1..dim).map(|j| ((i * j) as f64 * 0.013).sin()));
                let target = 0.01 * inputs[1] - 0.005 * inputs[2];
                TrainingSample { inputs, target, timestamp: i as i64 }
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &samples, |b, samples| {
            b.iter(|| black_box(trainer.fit(black_box(samples), &CancelToken::never())))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_aggregate,
    bench_predict,
    bench_decide_portfolio,
    bench_ridge_fit,
);

criterion_main!(benches);
