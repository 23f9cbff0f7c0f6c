//! Integration tests for KvCache.

use candle_core::{DType, Device, Tensor};
use nano_stream::core::kv_cache::{BATCH_DIM, KvCache, LayerKv};

const NUM_LAYERS: usize = 3;
const NUM_HEADS: usize = 2;
const HEAD_DIM: usize = 4;

/// Cache whose position `i` holds the value `base + i` everywhere.
fn ramp_cache(seq: usize, base: f32) -> KvCache {
    let device = Device::Cpu;
    let values: Vec<f32> = (0..seq).map(|i| base + i as f32).collect();
    let layers = (0..NUM_LAYERS)
        .map(|_| {
            let t = Tensor::from_vec(values.clone(), (1, 1, seq, 1), &device)
                .unwrap()
                .broadcast_as((1, NUM_HEADS, seq, HEAD_DIM))
                .unwrap()
                .contiguous()
                .unwrap();
            LayerKv::new(t.clone(), t).unwrap()
        })
        .collect();
    KvCache::new(layers).unwrap()
}

/// Values along the sequence axis of one row (layer 0 key, head 0, dim 0).
fn positions(cache: &KvCache, row: usize) -> Vec<f32> {
    cache.layers()[0]
        .key()
        .narrow(BATCH_DIM, row, 1)
        .unwrap()
        .narrow(1, 0, 1)
        .unwrap()
        .narrow(3, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn test_cache_layout() {
    let cache = ramp_cache(5, 0.0);

    assert_eq!(cache.num_layers(), NUM_LAYERS);
    assert_eq!(cache.seq_len(), 5);
    assert_eq!(cache.batch_size(), 1);
    assert_eq!(cache.dtype(), DType::F32);
    assert!(cache.device().same_device(&Device::Cpu));
    assert_eq!(cache.layers()[1].key().dims(), &[1, NUM_HEADS, 5, HEAD_DIM]);
}

#[test]
fn test_pad_stack_select() {
    // Two sessions of different lengths brought to a common length.
    let short = ramp_cache(2, 10.0).left_pad(3).unwrap();
    let long = ramp_cache(5, 20.0);

    let batch = KvCache::stack(&[short, long]).unwrap();
    assert_eq!(batch.batch_size(), 2);
    assert_eq!(batch.seq_len(), 5);
    assert_eq!(positions(&batch, 0), vec![0.0, 0.0, 0.0, 10.0, 11.0]);
    assert_eq!(positions(&batch, 1), vec![20.0, 21.0, 22.0, 23.0, 24.0]);

    let row = batch.select(0).unwrap();
    assert_eq!(row.batch_size(), 1);
    assert_eq!(positions(&row, 0), vec![0.0, 0.0, 0.0, 10.0, 11.0]);
    assert!(batch.select(2).is_err());
}

#[test]
fn test_keep_last_then_pad() {
    let cache = ramp_cache(6, 0.0).keep_last(3).unwrap();
    assert_eq!(positions(&cache, 0), vec![3.0, 4.0, 5.0]);

    let padded = cache.left_pad(1).unwrap();
    assert_eq!(padded.seq_len(), 4);
    assert_eq!(positions(&padded, 0), vec![0.0, 3.0, 4.0, 5.0]);

    // Keeping more than is cached is a no-op.
    assert_eq!(padded.keep_last(10).unwrap().seq_len(), 4);
}

#[test]
fn test_stack_requires_equal_lengths() {
    let result = KvCache::stack(&[ramp_cache(2, 0.0), ramp_cache(3, 0.0)]);
    assert!(result.is_err());
    assert!(KvCache::stack(&[]).is_err());
}

#[test]
fn test_layers_must_agree() {
    let device = Device::Cpu;
    let a = Tensor::zeros((1, NUM_HEADS, 2, HEAD_DIM), DType::F32, &device).unwrap();
    let b = Tensor::zeros((1, NUM_HEADS, 3, HEAD_DIM), DType::F32, &device).unwrap();

    // Key and value of one layer disagree on length.
    assert!(LayerKv::new(a.clone(), b.clone()).is_err());
    // Two layers disagree on length.
    assert!(KvCache::from_pairs(vec![(a.clone(), a), (b.clone(), b)]).is_err());

    let flat = Tensor::zeros((2, HEAD_DIM), DType::F32, &device).unwrap();
    assert!(LayerKv::new(flat.clone(), flat).is_err());
}
