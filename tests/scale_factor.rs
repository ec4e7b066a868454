use eegnet_golden::golden::quant::Levels;
use eegnet_golden::golden::scale::{div_factor, div_factor_batch_norm, FactorBias};
use eegnet_golden::GoldenError;
use pretty_assertions::assert_eq;

#[test]
fn batch_norm_factor_and_bias() {
    let fb = div_factor_batch_norm(0.5, 0.25, 2.0, &[1.0, 2.0], &[0.0, 0.5], Levels::DEFAULT, 1).unwrap();
    // factor = 2 * 127 / (bn_s * 0.125), bias = bn_o * 127^2 / (bn_s * 0.125)
    assert_eq!(fb, FactorBias::PerChannel { factor: vec![2032, 1016], bias: vec![0, 32258] });
}

#[test]
fn pool_multiplier_scales_factor_and_bias() {
    let fb = div_factor_batch_norm(0.5, 0.25, 2.0, &[1.0, 2.0], &[0.0, 0.5], Levels::DEFAULT, 8).unwrap();
    assert_eq!(fb.factors(), vec![16256, 8128]);
    assert_eq!(fb.biases(), vec![0, 258064]);
}

#[test]
fn derivation_is_deterministic() {
    let a = div_factor_batch_norm(0.731, 0.0123, 1.97, &[0.8, 1.3, 0.55], &[0.01, -0.2, 0.3], Levels::DEFAULT, 8);
    let b = div_factor_batch_norm(0.731, 0.0123, 1.97, &[0.8, 1.3, 0.55], &[0.01, -0.2, 0.3], Levels::DEFAULT, 8);
    assert_eq!(a, b);
    assert_eq!(div_factor(0.731, 0.0123, 1.97, Levels::DEFAULT, 1), div_factor(0.731, 0.0123, 1.97, Levels::DEFAULT, 1));
}

#[test]
fn invalid_scales_are_rejected() {
    assert!(matches!(
        div_factor(0.0, 1.0, 1.0, Levels::DEFAULT, 1),
        Err(GoldenError::InvalidScale { name: "input", .. })
    ));
    assert!(matches!(
        div_factor(1.0, f64::NAN, 1.0, Levels::DEFAULT, 1),
        Err(GoldenError::InvalidScale { name: "weight", .. })
    ));
    assert!(div_factor(1.0, 1.0, 1.0, Levels::DEFAULT, 0).is_err());
    assert!(div_factor_batch_norm(1.0, 1.0, 1.0, &[1.0], &[], Levels::DEFAULT, 1).is_err());
}

#[test]
fn oversized_factor_is_an_error() {
    assert!(matches!(div_factor(1e-6, 1e-6, 1e6, Levels::DEFAULT, 1), Err(GoldenError::FactorOverflow(_))));
}
