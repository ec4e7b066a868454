//! Every layer against a plain-loop recomputation of its integer arithmetic.

use eegnet_golden::golden::layers::{FusedLayer12, Layer, Layer1, Layer2, Layer3, Layer4, Layer5};
use eegnet_golden::golden::loader::NamedTensors;
use eegnet_golden::golden::scale::FactorBias;
use eegnet_golden::stimuli::{random_input, synthetic_network};
use eegnet_golden::{ModelOptions, NetParams, Tensor};
use pretty_assertions::assert_eq;

// C=4 T=128 F1=2 D=2 F2=4 T/8=16 T/64=2 N=3
fn small() -> (NamedTensors, NetParams) {
    let p = NetParams::new(4, 128, 2, 2, 3);
    let (net, _) = synthetic_network(&p, 11).unwrap();
    (net, p)
}

fn reordered() -> ModelOptions {
    ModelOptions { reorder_bn: true, ..ModelOptions::default() }
}

fn floor_div(a: i64, f: i64) -> i64 {
    assert!(f > 0, "synthetic networks have positive factors");
    a.div_euclid(f)
}

/// `(v + b + f // 2) // f`, clipped to the balanced grid.
fn rescale(v: i64, f: i64, b: i64) -> i32 {
    floor_div(v + b + f / 2, f).clamp(-127, 127) as i32
}

fn mean_of_8(s: i64) -> i32 {
    let (q, r) = (s.div_euclid(8), s.rem_euclid(8));
    (if r > 4 || (r == 4 && q % 2 != 0) { q + 1 } else { q }) as i32
}

/// Zero padding `(k/2 - 1, k/2)` followed by a full convolution with `w`.
fn conv_same(x: &[i32], w: &[i32]) -> Vec<i64> {
    let k = w.len();
    let mut padded = vec![0i64; k / 2 - 1];
    padded.extend(x.iter().map(|&v| v as i64));
    padded.extend(vec![0i64; k / 2]);
    (0..x.len())
        .map(|t| (0..k).map(|m| w[m] as i64 * padded[t + k - 1 - m]).sum())
        .collect()
}

/// ReLU at `-(b // 8)`, sum of 8, then the rescale.
fn pool_first(row: &[i64], f: i64, b: i64) -> Vec<i32> {
    let th = -b.div_euclid(8);
    row.chunks(8).map(|w| rescale(w.iter().map(|&v| v.max(th)).sum(), f, b)).collect()
}

/// Rescale, ReLU at 0, then the half-even mean of 8.
fn rescale_first(row: &[i64], f: i64, b: i64) -> Vec<i32> {
    row.chunks(8)
        .map(|w| mean_of_8(w.iter().map(|&v| rescale(v, f, b).max(0) as i64).sum()))
        .collect()
}

fn pair(fb: &FactorBias, k: usize) -> (i64, i64) {
    let (f, b) = fb.get(k);
    (f as i64, b as i64)
}

fn layer1_input(p: &NetParams) -> Tensor<i32> {
    random_input(vec![p.c, p.t], -60, 60, 3).unwrap()
}

/// `Σ_c x[k/D, c, t] * w[k, c]` for every `(k, t)`.
fn space_dot(x: &Tensor<i32>, w: &Tensor<i32>, p: &NetParams) -> Vec<Vec<i64>> {
    (0..p.f2())
        .map(|k| {
            (0..p.t)
                .map(|t| (0..p.c).map(|c| x.at(&[k / p.d, c, t]).unwrap() as i64 * w.at(&[k, c]).unwrap() as i64).sum())
                .collect()
        })
        .collect()
}

#[test]
fn layer1_is_convolution_then_channel_rescale() {
    let (net, p) = small();
    let l1 = Layer1::new(&net, &p, &ModelOptions::default()).unwrap();
    let x = layer1_input(&p);
    let mut expected = Vec::new();
    for g in 0..p.f1 {
        let (f, b) = pair(l1.factor_bias(), g);
        for c in 0..p.c {
            expected.extend(conv_same(x.row(c), l1.weights().row(g)).into_iter().map(|v| rescale(v, f, b)));
        }
    }
    assert_eq!(l1.apply(&x).unwrap().data(), expected.as_slice());
}

#[test]
fn layer2_pool_first_ordering() {
    let (net, p) = small();
    let opts = ModelOptions::default();
    let x = Layer1::new(&net, &p, &opts).unwrap().apply(&layer1_input(&p)).unwrap();
    let l2 = Layer2::new(&net, &p, &opts).unwrap();
    let expected: Vec<i32> = space_dot(&x, l2.weights(), &p)
        .iter()
        .enumerate()
        .flat_map(|(k, row)| {
            let (f, b) = pair(l2.factor_bias(), k);
            pool_first(row, f, b)
        })
        .collect();
    assert_eq!(l2.apply(&x).unwrap().data(), expected.as_slice());
}

#[test]
fn layer2_rescale_first_ordering() {
    let (net, p) = small();
    let x = Layer1::new(&net, &p, &reordered()).unwrap().apply(&layer1_input(&p)).unwrap();
    let l2 = Layer2::new(&net, &p, &reordered()).unwrap();
    let expected: Vec<i32> = space_dot(&x, l2.weights(), &p)
        .iter()
        .enumerate()
        .flat_map(|(k, row)| {
            let (f, b) = pair(l2.factor_bias(), k);
            rescale_first(row, f, b)
        })
        .collect();
    assert_eq!(l2.apply(&x).unwrap().data(), expected.as_slice());
}

#[test]
fn orderings_use_their_own_tables() {
    let (net, p) = small();
    let default = Layer2::new(&net, &p, &ModelOptions::default()).unwrap();
    let reordered = Layer2::new(&net, &p, &reordered()).unwrap();
    for k in 0..p.f2() {
        let (f8, _) = pair(default.factor_bias(), k);
        let (f1, _) = pair(reordered.factor_bias(), k);
        // the pool multiplier is applied before rounding
        assert!((f8 - 8 * f1).abs() <= 4, "channel {}: {} vs 8 * {}", k, f8, f1);
    }
}

#[test]
fn layer3_is_depthwise_convolution_then_scalar_rescale() {
    let (net, p) = small();
    let l3 = Layer3::new(&net, &p, &ModelOptions::default()).unwrap();
    let x = random_input(vec![p.f2(), p.t8()], -127, 128, 4).unwrap();
    let (f, b) = pair(l3.factor_bias(), 0);
    let expected: Vec<i32> = (0..p.f2())
        .flat_map(|k| conv_same(x.row(k), l3.weights().row(k)).into_iter().map(move |v| rescale(v, f, b)))
        .collect();
    assert_eq!(l3.apply(&x).unwrap().data(), expected.as_slice());
}

#[test]
fn layer4_pointwise_then_both_orderings() {
    let (net, p) = small();
    let x = random_input(vec![p.f2(), p.t8()], -127, 128, 5).unwrap();
    for opts in [ModelOptions::default(), reordered()] {
        let l4 = Layer4::new(&net, &p, &opts).unwrap();
        let expected: Vec<i32> = (0..p.f2())
            .flat_map(|k| {
                let row: Vec<i64> = (0..p.t8())
                    .map(|t| (0..p.f2()).map(|i| l4.weights().at(&[k, i]).unwrap() as i64 * x.at(&[i, t]).unwrap() as i64).sum())
                    .collect();
                let (f, b) = pair(l4.factor_bias(), k);
                if opts.reorder_bn { rescale_first(&row, f, b) } else { pool_first(&row, f, b) }
            })
            .collect();
        assert_eq!(l4.apply(&x).unwrap().data(), expected.as_slice(), "reorder_bn = {}", opts.reorder_bn);
    }
}

#[test]
fn layer5_is_linear_plus_bias_then_scalar_rescale() {
    let (net, p) = small();
    let l5 = Layer5::new(&net, &p, &ModelOptions::default()).unwrap();
    let x = random_input(vec![p.f2(), p.t64()], -127, 128, 6).unwrap();
    let (f, b) = pair(l5.factor_bias(), 0);
    let expected: Vec<i32> = (0..p.n)
        .map(|n| {
            let acc: i64 = l5.weights().row(n).iter().zip(x.data()).map(|(&w, &v)| w as i64 * v as i64).sum();
            rescale(acc + l5.bias().data()[n] as i64, f, b)
        })
        .collect();
    assert_eq!(l5.apply(&x).unwrap().data(), expected.as_slice());
}

#[test]
fn fused_layer_composes_tables_and_skips_the_intermediate_rescale() {
    let (net, p) = small();
    let opts = ModelOptions::default();
    let l1 = Layer1::new(&net, &p, &opts).unwrap();
    let l2 = Layer2::new(&net, &p, &opts).unwrap();
    let fused = FusedLayer12::fuse(&l1, &l2).unwrap();

    let composed: Vec<(i64, i64)> = (0..p.f2())
        .map(|k| {
            let (f1, _) = pair(l1.factor_bias(), k / p.d);
            let (f2, b2) = pair(l2.factor_bias(), k);
            (f2 * f1, b2 * f1)
        })
        .collect();
    let table = FactorBias::per_channel(
        composed.iter().map(|&(f, _)| f as i32).collect(),
        composed.iter().map(|&(_, b)| b as i32).collect(),
    )
    .unwrap();
    assert_eq!(fused.factor_bias(), &table);
    let thresholds: Vec<i64> = composed.iter().map(|&(_, b)| -b.div_euclid(8)).collect();
    assert_eq!(fused.threshold(), thresholds.as_slice());

    let x = layer1_input(&p);
    // [F1][C][T] accumulator with the layer 1 bias, never divided
    let acc: Vec<Vec<Vec<i64>>> = (0..p.f1)
        .map(|g| {
            let (_, b1) = pair(l1.factor_bias(), g);
            (0..p.c).map(|c| conv_same(x.row(c), l1.weights().row(g)).into_iter().map(|v| v + b1).collect()).collect()
        })
        .collect();
    let expected: Vec<i32> = (0..p.f2())
        .flat_map(|k| {
            let row: Vec<i64> = (0..p.t)
                .map(|t| (0..p.c).map(|c| acc[k / p.d][c][t] * l2.weights().at(&[k, c]).unwrap() as i64).sum())
                .collect();
            let (f, b) = composed[k];
            pool_first(&row, f, b)
        })
        .collect();
    assert_eq!(fused.apply(&x).unwrap().data(), expected.as_slice());
}
