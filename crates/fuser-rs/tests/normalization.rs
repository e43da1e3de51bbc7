use fuser_rs::layout::MemoryFormat;
use fuser_rs::module::Module;
use fuser_rs::nn::normalization::{
    detect_channels_last, NormConfig, NormError, NormFunction, NormInputs, NormLayer, NormOptions,
    StatAxes,
};
use fuser_rs::tensor::{DType, Tensor};
use fuser_rs_backend_ref_cpu::CpuBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

const EPS: f64 = 1e-5;

fn randn(sizes: &[usize], dtype: DType, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::randn(sizes.to_vec(), 1.0, dtype, &mut rng)
}

fn tracked_affine() -> NormConfig {
    NormConfig {
        affine: true,
        track_running_stats: true,
        dtype: DType::F64,
        ..NormConfig::default()
    }
}

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "element {i}: {a} vs {e}"
        );
    }
}

/// Biased mean and variance of each group of `group_len` consecutive elements.
fn group_stats(data: &[f64], group_len: usize) -> Vec<(f64, f64)> {
    data.chunks(group_len)
        .map(|group| {
            let n = group.len() as f64;
            let mean = group.iter().sum::<f64>() / n;
            let var = group.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (mean, var)
        })
        .collect()
}

#[test]
fn instance_norm_2d_normalizes_each_sample_and_channel() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::instance_norm_2d(3, &tracked_affine());
    let x = randn(&[2, 3, 4, 4], DType::F64, 1);
    let (out, ctx) = layer.forward(&backend, &x).expect("forward");

    let data = x.to_vec_f64();
    let stats = group_stats(&data, 16);
    let expected: Vec<f64> = data
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let (mean, var) = stats[i / 16];
            (v - mean) / (var + EPS).sqrt()
        })
        .collect();
    assert_eq!(out.sizes(), &[2, 3, 4, 4]);
    assert_close(&out.to_vec_f64(), &expected, 1e-10);
    assert_eq!(ctx.mean.sizes(), &[2, 3]);
    assert_eq!(ctx.invstd.sizes(), &[2, 3]);

    // Running stats average the per-sample statistics over the batch.
    let expected_mean: Vec<f64> = (0..3)
        .map(|c| 0.1 * (stats[c].0 + stats[3 + c].0) / 2.0)
        .collect();
    let expected_var: Vec<f64> = (0..3)
        .map(|c| 0.9 + 0.1 * (stats[c].1 + stats[3 + c].1) / 2.0 * 16.0 / 15.0)
        .collect();
    let running_mean = layer.running_mean.as_ref().expect("tracked");
    let running_var = layer.running_var.as_ref().expect("tracked");
    assert_close(&running_mean.to_vec_f64(), &expected_mean, 1e-12);
    assert_close(&running_var.to_vec_f64(), &expected_var, 1e-12);
    let count = layer.num_batches_tracked.as_ref().expect("tracked");
    assert_eq!(count.item().expect("scalar"), 1.0);
}

#[test]
fn affine_instance_norm_backward_produces_parameter_gradients() {
    let backend = CpuBackend::new();
    let config = NormConfig {
        affine: true,
        ..NormConfig::default()
    };
    let mut layer = NormLayer::instance_norm_2d(3, &config);
    let x = randn(&[2, 3, 4, 4], DType::F32, 12);
    let (out, ctx) = layer.forward(&backend, &x).expect("forward");
    assert_eq!(out.sizes(), x.sizes());

    let grad_input = layer
        .backward(&backend, &ctx, &Tensor::ones([2, 3, 4, 4], DType::F32))
        .expect("backward");
    assert_eq!(grad_input.sizes(), &[2, 3, 4, 4]);
    let weight_grad = layer.weight.as_ref().and_then(|p| p.grad.as_ref());
    let bias_grad = layer.bias.as_ref().and_then(|p| p.grad.as_ref());
    assert_eq!(weight_grad.expect("weight grad").sizes(), &[3]);
    // Each channel sees 2 * 16 unit gradients.
    assert_eq!(bias_grad.expect("bias grad").to_vec_f64(), vec![32.0; 3]);
}

#[test]
fn batch_norm_running_stats_are_not_divided_by_batch() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::batch_norm(2, &tracked_affine());
    let x = randn(&[4, 2, 3], DType::F64, 2);
    let (out, _) = layer.forward(&backend, &x).expect("forward");

    let data = x.to_vec_f64();
    let per_channel: Vec<Vec<f64>> = (0..2)
        .map(|c| {
            (0..4)
                .flat_map(|n| data[n * 6 + c * 3..n * 6 + c * 3 + 3].to_vec())
                .collect()
        })
        .collect();
    let stats: Vec<(f64, f64)> = per_channel
        .iter()
        .map(|values| group_stats(values, values.len())[0])
        .collect();

    let running_mean = layer.running_mean.as_ref().expect("tracked").to_vec_f64();
    let running_var = layer.running_var.as_ref().expect("tracked").to_vec_f64();
    for c in 0..2 {
        let (mean, var) = stats[c];
        assert!((running_mean[c] - 0.1 * mean).abs() < 1e-12);
        assert!((running_var[c] - (0.9 + 0.1 * var * 12.0 / 11.0)).abs() < 1e-12);
    }

    let out = out.to_vec_f64();
    for n in 0..4 {
        for c in 0..2 {
            for l in 0..3 {
                let i = n * 6 + c * 3 + l;
                let (mean, var) = stats[c];
                let expected = (data[i] - mean) / (var + EPS).sqrt();
                assert!((out[i] - expected).abs() < 1e-10, "index {i}");
            }
        }
    }
}

#[test]
fn batch_norm_eval_uses_running_stats() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::batch_norm(2, &tracked_affine());
    layer
        .running_mean
        .as_ref()
        .expect("tracked")
        .copy_from(&Tensor::from_vec([2], vec![1.0, -1.0], DType::F64).expect("mean"))
        .expect("copy");
    layer
        .running_var
        .as_ref()
        .expect("tracked")
        .copy_from(&Tensor::from_vec([2], vec![4.0, 0.25], DType::F64).expect("var"))
        .expect("copy");
    layer.eval();

    let x = Tensor::from_vec([1, 2, 2], vec![3.0, 5.0, 0.0, 1.0], DType::F64).expect("x");
    let (out, ctx) = layer.forward(&backend, &x).expect("forward");
    assert!(!ctx.use_input_stats);
    let expected = [
        2.0 / (4.0 + EPS).sqrt(),
        4.0 / (4.0 + EPS).sqrt(),
        1.0 / (0.25 + EPS).sqrt(),
        2.0 / (0.25 + EPS).sqrt(),
    ];
    assert_close(&out.to_vec_f64(), &expected, 1e-12);
    assert_eq!(
        layer.running_mean.as_ref().expect("tracked").to_vec_f64(),
        vec![1.0, -1.0]
    );
    assert_eq!(
        layer
            .num_batches_tracked
            .as_ref()
            .expect("tracked")
            .item()
            .expect("scalar"),
        0.0
    );

    let grad = Tensor::ones([1, 2, 2], DType::F64);
    let grad_input = layer.backward(&backend, &ctx, &grad).expect("backward");
    let expected = [
        1.0 / (4.0 + EPS).sqrt(),
        1.0 / (4.0 + EPS).sqrt(),
        1.0 / (0.25 + EPS).sqrt(),
        1.0 / (0.25 + EPS).sqrt(),
    ];
    assert_close(&grad_input.to_vec_f64(), &expected, 1e-12);
}

#[test]
fn instance_norm_eval_uses_running_stats() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::instance_norm_2d(2, &tracked_affine());
    layer
        .running_mean
        .as_ref()
        .expect("tracked")
        .copy_from(&Tensor::from_vec([2], vec![0.5, -2.0], DType::F64).expect("mean"))
        .expect("copy");
    layer
        .running_var
        .as_ref()
        .expect("tracked")
        .copy_from(&Tensor::from_vec([2], vec![9.0, 1.0], DType::F64).expect("var"))
        .expect("copy");
    layer.eval();

    let data = vec![1.0, 2.0, 0.0, -1.0, 3.0, 0.5, 4.0, -3.0];
    let x = Tensor::from_vec([2, 2, 1, 2], data.clone(), DType::F64).expect("x");
    let (out, ctx) = layer.forward(&backend, &x).expect("forward");
    assert!(!ctx.use_input_stats);
    let mean = [0.5, -2.0];
    let var = [9.0, 1.0];
    let channel = |i: usize| (i / 2) % 2;
    let expected: Vec<f64> = data
        .iter()
        .enumerate()
        .map(|(i, v)| (v - mean[channel(i)]) / (var[channel(i)] + EPS).sqrt())
        .collect();
    assert_close(&out.to_vec_f64(), &expected, 1e-12);

    let grad = randn(&[2, 2, 1, 2], DType::F64, 21);
    let grad_input = layer.backward(&backend, &ctx, &grad).expect("backward");
    let expected: Vec<f64> = grad
        .to_vec_f64()
        .iter()
        .enumerate()
        .map(|(i, g)| g / (var[channel(i)] + EPS).sqrt())
        .collect();
    assert_close(&grad_input.to_vec_f64(), &expected, 1e-12);
    let bias_grad = layer.bias.as_ref().and_then(|p| p.grad.as_ref());
    assert_eq!(bias_grad.expect("bias grad").sizes(), &[2]);
}

#[test]
fn failed_forward_leaves_batch_count_untouched() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::batch_norm(3, &tracked_affine());
    let x = randn(&[2, 4, 5], DType::F64, 22);
    assert!(layer.forward(&backend, &x).is_err());
    let count = layer.num_batches_tracked.as_ref().expect("tracked");
    assert_eq!(count.item().expect("scalar"), 0.0);
    assert_eq!(
        layer.running_mean.as_ref().expect("tracked").to_vec_f64(),
        vec![0.0; 3]
    );
}

#[test]
fn running_variance_ignores_the_unbiased_flag() {
    let backend = CpuBackend::new();
    let x = randn(&[3, 2, 4], DType::F64, 23);
    let run = |unbiased: bool| {
        let running_mean = Tensor::zeros([2], DType::F64);
        let running_var = Tensor::ones([2], DType::F64);
        let options = NormOptions {
            use_input_stats: true,
            momentum: 0.1,
            eps: EPS,
            unbiased,
            stat_axes: StatAxes::BATCH_NORM,
        };
        let (out, _) = NormFunction::forward(
            &backend,
            NormInputs {
                x: &x,
                weight: None,
                bias: None,
                running_mean: Some(&running_mean),
                running_var: Some(&running_var),
            },
            &options,
        )
        .expect("forward");
        (out.to_vec_f64(), running_var.to_vec_f64())
    };
    let (biased_out, biased_var) = run(false);
    let (unbiased_out, unbiased_var) = run(true);
    assert_close(&unbiased_var, &biased_var, 1e-14);
    assert_ne!(biased_out, unbiased_out);
    // Only the normalizing variance changes: 12 elements per channel.
    let ratio = biased_out[0] / unbiased_out[0];
    assert!((ratio - (12.0f64 / 11.0).sqrt()).abs() < 1e-4, "{ratio}");
}

#[test]
fn layer_norm_keeps_scalar_running_stats() {
    let backend = CpuBackend::new();
    let mut layer = NormLayer::layer_norm(3, &tracked_affine());
    let x = randn(&[2, 3, 4], DType::F64, 3);
    let (out, ctx) = layer.forward(&backend, &x).expect("forward");

    let data = x.to_vec_f64();
    let stats = group_stats(&data, 12);
    assert_eq!(ctx.mean.sizes(), &[2]);
    let running_mean = layer.running_mean.as_ref().expect("tracked");
    assert!(running_mean.sizes().is_empty());
    let expected_mean = 0.1 * (stats[0].0 + stats[1].0) / 2.0;
    assert!((running_mean.item().expect("scalar") - expected_mean).abs() < 1e-12);

    let expected: Vec<f64> = data
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let (mean, var) = stats[i / 12];
            (v - mean) / (var + EPS).sqrt()
        })
        .collect();
    assert_close(&out.to_vec_f64(), &expected, 1e-10);
}

fn weighted_loss(
    backend: &CpuBackend,
    x: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    grad: &[f64],
    options: &NormOptions,
) -> f64 {
    let (out, _) = NormFunction::forward(
        backend,
        NormInputs {
            x,
            weight: Some(weight),
            bias: Some(bias),
            running_mean: None,
            running_var: None,
        },
        options,
    )
    .expect("forward");
    out.to_vec_f64().iter().zip(grad).map(|(o, g)| o * g).sum()
}

fn perturbed(tensor: &Tensor, index: usize, delta: f64) -> Tensor {
    let mut data = tensor.to_vec_f64();
    data[index] += delta;
    Tensor::from_vec(tensor.sizes().to_vec(), data, tensor.dtype()).expect("perturbed")
}

fn check_gradients(stat_axes: StatAxes, param_shape: &[usize], use_input_stats: bool) {
    let backend = CpuBackend::new();
    let options = NormOptions {
        use_input_stats,
        momentum: 0.1,
        eps: EPS,
        unbiased: false,
        stat_axes,
    };
    let x = randn(&[2, 2, 3, 3], DType::F64, 4);
    let weight = randn(param_shape, DType::F64, 5);
    let bias = randn(param_shape, DType::F64, 6);
    let grad_output = randn(&[2, 2, 3, 3], DType::F64, 7);
    let grad = grad_output.to_vec_f64();

    let (_, ctx) = NormFunction::forward(
        &backend,
        NormInputs {
            x: &x,
            weight: Some(&weight),
            bias: Some(&bias),
            running_mean: None,
            running_var: None,
        },
        &options,
    )
    .expect("forward");
    // Batch statistics are the only ones available without running stats.
    assert!(ctx.use_input_stats);
    let grads = NormFunction::backward(&backend, &ctx, &grad_output).expect("backward");

    let h = 1e-6;
    let numeric = |which: usize, index: usize| {
        let (plus, minus) = match which {
            0 => (
                weighted_loss(&backend, &perturbed(&x, index, h), &weight, &bias, &grad, &options),
                weighted_loss(&backend, &perturbed(&x, index, -h), &weight, &bias, &grad, &options),
            ),
            1 => (
                weighted_loss(&backend, &x, &perturbed(&weight, index, h), &bias, &grad, &options),
                weighted_loss(&backend, &x, &perturbed(&weight, index, -h), &bias, &grad, &options),
            ),
            _ => (
                weighted_loss(&backend, &x, &weight, &perturbed(&bias, index, h), &grad, &options),
                weighted_loss(&backend, &x, &weight, &perturbed(&bias, index, -h), &grad, &options),
            ),
        };
        (plus - minus) / (2.0 * h)
    };

    let grad_input = grads.grad_input.to_vec_f64();
    for (i, analytic) in grad_input.iter().enumerate() {
        let estimate = numeric(0, i);
        assert!((analytic - estimate).abs() < 1e-5, "grad_input[{i}]: {analytic} vs {estimate}");
    }
    let grad_weight = grads.grad_weight.expect("weight given").to_vec_f64();
    let grad_bias = grads.grad_bias.expect("bias given").to_vec_f64();
    assert_eq!(grad_weight.len(), weight.numel());
    for i in 0..weight.numel() {
        assert!((grad_weight[i] - numeric(1, i)).abs() < 1e-5, "grad_weight[{i}]");
        assert!((grad_bias[i] - numeric(2, i)).abs() < 1e-5, "grad_bias[{i}]");
    }
}

#[test]
fn instance_norm_gradients_match_finite_differences() {
    check_gradients(StatAxes::INSTANCE, &[2], true);
}

#[test]
fn batch_norm_gradients_match_finite_differences() {
    check_gradients(StatAxes::BATCH_NORM, &[2], true);
}

#[test]
fn layer_norm_gradients_match_finite_differences() {
    check_gradients(StatAxes::LAYER_NORM, &[], true);
}

#[test]
fn inference_flag_without_running_stats_uses_batch_statistics() {
    check_gradients(StatAxes::BATCH_NORM, &[2], false);
    check_gradients(StatAxes::INSTANCE, &[2], false);
}

#[test]
fn channels_last_matches_channels_first() {
    let backend = CpuBackend::new();
    let mut nchw = NormLayer::instance_norm_2d(3, &tracked_affine());
    let mut nhwc = NormLayer::instance_norm_2d(3, &tracked_affine());
    let x = randn(&[2, 3, 4, 5], DType::F64, 8);
    let x_last = x
        .to_memory_format(MemoryFormat::ChannelsLast)
        .expect("channels last");
    assert!(detect_channels_last(&x_last));
    assert!(!detect_channels_last(&x));

    let (out, ctx) = nchw.forward(&backend, &x).expect("forward");
    let (out_last, ctx_last) = nhwc.forward(&backend, &x_last).expect("forward");
    assert!(ctx_last.channels_last);
    assert_eq!(out_last.sizes(), &[2, 3, 4, 5]);
    assert!(out_last.is_contiguous_format(MemoryFormat::ChannelsLast));
    assert_close(&out_last.to_vec_f64(), &out.to_vec_f64(), 1e-12);
    assert_close(
        &nhwc.running_var.as_ref().expect("tracked").to_vec_f64(),
        &nchw.running_var.as_ref().expect("tracked").to_vec_f64(),
        1e-12,
    );

    let grad = randn(&[2, 3, 4, 5], DType::F64, 9);
    let grad_last = grad
        .to_memory_format(MemoryFormat::ChannelsLast)
        .expect("channels last");
    let grad_input = nchw.backward(&backend, &ctx, &grad).expect("backward");
    let grad_input_last = nhwc.backward(&backend, &ctx_last, &grad_last).expect("backward");
    assert!(grad_input_last.is_contiguous_format(MemoryFormat::ChannelsLast));
    assert_close(&grad_input_last.to_vec_f64(), &grad_input.to_vec_f64(), 1e-10);
    let weight_grad = |layer: &NormLayer| {
        layer
            .weight
            .as_ref()
            .and_then(|p| p.grad.as_ref())
            .expect("accumulated")
            .to_vec_f64()
    };
    assert_close(&weight_grad(&nhwc), &weight_grad(&nchw), 1e-10);
}

#[test]
fn single_channel_inputs_stay_channels_first() {
    let x = randn(&[2, 1, 4, 4], DType::F32, 10)
        .to_memory_format(MemoryFormat::ChannelsLast)
        .expect("channels last");
    assert!(!detect_channels_last(&x));

    let mut layer = NormLayer::instance_norm_2d(1, &NormConfig::default());
    let (_, ctx) = layer.forward(&CpuBackend::new(), &x).expect("forward");
    assert!(!ctx.channels_last);
}

#[test]
fn instance_norm_rejects_wrong_rank() {
    let mut layer = NormLayer::instance_norm_2d(3, &NormConfig::default());
    let err = layer
        .forward(&CpuBackend::new(), &Tensor::zeros([3, 4, 4], DType::F32))
        .expect_err("3-D input");
    assert_eq!(err.to_string(), "expected 4D input (got 3D input)");
}

#[test]
fn running_stats_must_come_in_pairs() {
    let x = Tensor::zeros([2, 3, 4], DType::F32);
    let running_mean = Tensor::zeros([3], DType::F32);
    let err = NormFunction::forward(
        &CpuBackend::new(),
        NormInputs {
            x: &x,
            weight: None,
            bias: None,
            running_mean: Some(&running_mean),
            running_var: None,
        },
        &NormOptions {
            use_input_stats: true,
            momentum: 0.1,
            eps: EPS,
            unbiased: false,
            stat_axes: StatAxes::BATCH_NORM,
        },
    )
    .expect_err("unpaired stats");
    assert_eq!(
        err.downcast_ref::<NormError>(),
        Some(&NormError::UnpairedRunningStats)
    );
}

#[test]
fn half_precision_inputs_compute_in_f32() {
    let config = NormConfig {
        affine: true,
        track_running_stats: true,
        dtype: DType::F16,
        ..NormConfig::default()
    };
    let mut layer = NormLayer::instance_norm_2d(3, &config);
    let x = randn(&[2, 3, 4, 4], DType::F16, 11);
    let (out, ctx) = layer.forward(&CpuBackend::new(), &x).expect("forward");
    assert_eq!(out.dtype(), DType::F16);
    assert_eq!(ctx.mean.dtype(), DType::F32);
    assert_eq!(
        layer.running_mean.as_ref().expect("tracked").dtype(),
        DType::F16
    );

    let stats = group_stats(&x.to_vec_f64(), 16);
    let expected: Vec<f64> = x
        .to_vec_f64()
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let (mean, var) = stats[i / 16];
            (v - mean) / (var + EPS).sqrt()
        })
        .collect();
    for (a, e) in out.to_vec_f64().iter().zip(&expected) {
        assert!((a - e).abs() < 1e-2 * (1.0 + e.abs()), "{a} vs {e}");
    }
}

#[test]
fn state_dict_names_follow_enabled_buffers() {
    let layer = NormLayer::batch_norm(4, &tracked_affine());
    let state = layer.state_dict().expect("state dict");
    let keys: Vec<&str> = state.keys().collect();
    assert_eq!(
        keys,
        vec![
            "bias",
            "num_batches_tracked",
            "running_mean",
            "running_var",
            "weight"
        ]
    );
    assert_eq!(state.version(""), Some(2));

    let plain = NormLayer::instance_norm_1d(4, &NormConfig::default());
    assert!(plain.state_dict().expect("state dict").is_empty());
}
