use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use fusion::{
    CrossAttentionConfig, EncoderConfig, GatedCrossAttentionBlock, GatedCrossAttentionConfig,
    MediaInputs, StateDict, TransformerEncoder,
};

fn encoder_config() -> EncoderConfig {
    EncoderConfig {
        d_word_vec: 8,
        d_model: 8,
        n_layers: 2,
        n_head: 2,
        d_k: 4,
        d_v: 4,
        d_inner: 16,
        n_position: 6,
        ..EncoderConfig::default()
    }
}

fn max_diff(lhs: &Tensor, rhs: &Tensor) -> Result<f32> {
    Ok(lhs.sub(rhs)?.abs()?.max_all()?.to_vec0::<f32>()?)
}

#[test]
fn encoder_survives_safetensors_round_trip() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Device::Cpu;
    let encoder = TransformerEncoder::new(encoder_config(), DType::F32, &device)?;
    let state = encoder.state_dict();
    assert!(state.contains("layer_stack.1.slf_attn.w_qs.weight"));
    assert!(state.contains("layer_stack.0.pos_ffn.layer_norm.bias"));
    assert!(state.contains("layer_norm.weight"));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("encoder.safetensors");
    state.save(&path)?;
    let reloaded = TransformerEncoder::from_safetensors(encoder_config(), &path, DType::F32, &device)?;

    let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
    assert!(max_diff(&encoder.forward(&x)?, &reloaded.forward(&x)?)? < 1e-6);
    Ok(())
}

#[test]
fn stored_position_table_is_ignored() -> Result<()> {
    let device = Device::Cpu;
    let encoder = TransformerEncoder::new(encoder_config(), DType::F32, &device)?;
    let mut state = encoder.state_dict();
    state.insert(
        "position_enc.pos_table",
        Tensor::zeros((1, 6, 8), DType::F32, &device)?,
    );
    let reloaded = TransformerEncoder::from_state(encoder_config(), &state, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
    assert!(max_diff(&encoder.forward(&x)?, &reloaded.forward(&x)?)? < 1e-6);
    Ok(())
}

#[test]
fn missing_tensors_name_the_parameter() -> Result<()> {
    let device = Device::Cpu;
    let encoder = TransformerEncoder::new(encoder_config(), DType::F32, &device)?;
    let mut tensors = encoder.state_dict().into_inner();
    tensors.remove("layer_stack.1.pos_ffn.w_1.bias");
    let err = TransformerEncoder::from_state(encoder_config(), &StateDict::from(tensors), &device)
        .expect_err("incomplete checkpoint");
    assert!(err.to_string().contains("layer_stack.1.pos_ffn.w_1.bias"));
    Ok(())
}

#[test]
fn gated_block_round_trip_in_half_precision() -> Result<()> {
    let device = Device::Cpu;
    let config = GatedCrossAttentionConfig {
        ff_mult: 2.0,
        ..GatedCrossAttentionConfig::new(CrossAttentionConfig {
            dim_head: 4,
            heads: 2,
            ..CrossAttentionConfig::new(8, 6, 2)
        })
    };
    let block = GatedCrossAttentionBlock::new(config.clone(), DType::F32, &device)?;
    block.attn_gate().set(&Tensor::new(&[0.5f32], &device)?)?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("block.safetensors");
    block.state_dict().save(&path)?;
    let reloaded = GatedCrossAttentionBlock::from_safetensors(config, &path, DType::BF16, &device)?;
    assert!((reloaded.attn_gate().factor()? - 0.5f32.tanh()).abs() < 1e-2);
    assert_eq!(reloaded.ff_gate().factor()?, 0.0);

    let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?.to_dtype(DType::BF16)?;
    let media = Tensor::randn(0f32, 1.0, (1, 4, 1, 6), &device)?.to_dtype(DType::BF16)?;
    let mask = Tensor::ones((1, 4, 1), DType::U8, &device)?;
    let locations = Tensor::from_vec(vec![1u8, 0, 1], (1, 3), &device)?;
    let out = reloaded.forward(&x, &MediaInputs::new(&media, &mask).with_locations(&locations))?;
    assert_eq!(out.dims(), &[1, 3, 8]);
    assert_eq!(out.dtype(), DType::BF16);
    Ok(())
}
