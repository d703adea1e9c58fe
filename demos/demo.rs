//! Demo: a synthetic quantification experiment end to end
use quant_eval::{
    classify_count::{ClassifyAndCount, CountMethod},
    data::{ColumnMap, DataError, FeatureMatrix, PredictionSet},
    quantifier::{PrevalenceEstimate, Quantifier, QuantifierError},
    report::ReportBuilder,
    runner::{FeatureInputs, Orchestrator, RunInputs},
    sampling::Sample,
    RateEstimates, RunConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const RUN: &str = r"
dataset: synthetic
seed: 7
sample_size: 100
samples_per_prevalence: 5
note: demo
predictions:
  validation: unused.jsonl
  test: unused.jsonl
em:
  grid:
    alpha: [0.1, 1.0, 10.0]
    fit_prior: [true]
selection:
  samples_per_prevalence: 2
statistics:
  bootstrap_n: 1000
";

/// A classifier that is right about 80% of the time, with soft scores to match
fn predictions(labels: &[u8], rng: &mut ChaCha8Rng) -> Result<PredictionSet, DataError> {
    let soft: Vec<f64> = labels
        .iter()
        .map(|&y| {
            let noise: f64 = rng.gen_range(0.0..0.6);
            if y == 1 { 0.4 + noise } else { 0.6 - noise }
        })
        .collect();
    let hard = soft.iter().map(|&p| u8::from(p >= 0.5)).collect();
    PredictionSet::new(labels.to_vec(), hard, soft)
}

/// Two topical words plus a shared one, drawn as small counts
fn features(labels: &[u8], rng: &mut ChaCha8Rng) -> FeatureMatrix {
    let rows = labels
        .iter()
        .map(|&y| {
            let (own, other) = if y == 1 { (0, 1) } else { (1, 0) };
            let mut row = vec![
                (own, f64::from(rng.gen_range(1_u8..4))),
                (other, f64::from(rng.gen_range(0_u8..2))),
                (2, f64::from(rng.gen_range(0_u8..3))),
            ];
            row.retain(|&(_, v)| v > 0.0);
            row.sort_by_key(|&(i, _)| i);
            row
        })
        .collect();
    FeatureMatrix::new(rows)
}

fn labels(n: usize, rng: &mut ChaCha8Rng) -> Vec<u8> {
    (0..n).map(|_| u8::from(rng.gen_bool(0.4))).collect()
}

/// Mean of the two adjusted counts
struct Blend<'a> {
    acc: ClassifyAndCount<'a>,
    apcc: ClassifyAndCount<'a>,
}

impl Quantifier for Blend<'_> {
    fn name(&self) -> &str {
        "blend"
    }

    fn quantify(&self, sample: &Sample) -> Result<PrevalenceEstimate, QuantifierError> {
        let a = self.acc.quantify(sample)?.prevalence();
        let b = self.apcc.quantify(sample)?.prevalence();
        Ok(PrevalenceEstimate::new((a + b) / 2.0))
    }
}

fn main() -> anyhow::Result<()> {
    println!("=== Quant Eval Demo ===\n");
    let mut rng = ChaCha8Rng::seed_from_u64(2024);

    // 1. Column reordering for a model that fitted classes as [1, 0]
    let map = ColumnMap::new(&[1_u8, 0], &[0, 1])?;
    let reordered = map.reorder(&[vec![0.9, 0.1], vec![0.25, 0.75]])?;
    println!("Posteriors reordered to [negative, positive]: {reordered:?}\n");

    // 2. Synthetic data
    let train_labels = labels(1500, &mut rng);
    let validation_labels = labels(1500, &mut rng);
    let test_labels = labels(3000, &mut rng);
    let validation = predictions(&validation_labels, &mut rng)?;
    let test = predictions(&test_labels, &mut rng)?;
    let inputs = RunInputs {
        features: Some(FeatureInputs {
            train: features(&train_labels, &mut rng),
            validation: features(&validation_labels, &mut rng),
            test: features(&test_labels, &mut rng),
            train_labels,
            validation_labels,
        }),
        validation,
        test,
    };

    let rates = RateEstimates::from_predictions(&inputs.validation)?;
    println!(
        "Validation rates: tpr {:.3}, fpr {:.3}, ptpr {:.3}, pfpr {:.3}\n",
        rates.tpr, rates.fpr, rates.ptpr, rates.pfpr
    );

    // 3. Full protocol with an in-process primary quantifier
    let config = RunConfig::from_yaml(RUN)?;
    let stats = config.stat_config();
    let orchestrator = Orchestrator::new(config);
    let blend = Blend {
        acc: ClassifyAndCount::new(CountMethod::Acc, &inputs.test, rates),
        apcc: ClassifyAndCount::new(CountMethod::Apcc, &inputs.test, rates),
    };

    let evaluation = orchestrator.evaluate(&inputs, Some(&blend))?;
    let report = ReportBuilder::from_evaluation(&evaluation)
        .with_stat_config(stats)
        .build();
    println!("{}", report.to_markdown());

    println!("=== Demo Complete ===");
    Ok(())
}
