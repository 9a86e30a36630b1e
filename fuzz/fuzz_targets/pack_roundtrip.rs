#![no_main]
// Q4Gemm pack/unpack roundtrip fuzzer: feeds arbitrary (qtype, K, values)
// combinations through q4_gemm_pack_b / q4_gemm_unpack_b and checks the
// invariants pack_block/unpack_block must hold regardless of input, without
// re-deriving the expected bytes (that's layout_vectors.rs's job).

use libfuzzer_sys::fuzz_target;

use blockwise_quant::parallel::SerialExecutor;
use blockwise_quant::q4gemm::{q4_gemm_pack_b, q4_gemm_pack_b_size, q4_gemm_unpack_b};
use blockwise_quant::QuantType;

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    qtype_selector: u8,
    k: u16,
    values: Vec<f32>,
}

fn pick_qtype(selector: u8) -> QuantType {
    match selector % 4 {
        0 => QuantType::Sym,
        1 => QuantType::Asym,
        2 => QuantType::Sym64,
        _ => QuantType::Sym128,
    }
}

fuzz_target!(|input: Input| {
    // Bound K so the fuzzer doesn't spend all its time allocating; one
    // column, since N just multiplies the column loop and this target is
    // after the per-block packing logic, not the column fan-out.
    let k = (input.k as usize % 512) + 1;
    let qtype = pick_qtype(input.qtype_selector);

    let mut src = vec![0f32; k];
    for (i, slot) in src.iter_mut().enumerate() {
        let v = input.values.get(i).copied().unwrap_or(0.0);
        // Reject non-finite inputs: §3's invariants assume a finite source
        // matrix, and NaN/inf would make the min/max scan itself ill-defined.
        *slot = if v.is_finite() { v.clamp(-1.0e6, 1.0e6) } else { 0.0 };
    }

    let size = q4_gemm_pack_b_size(qtype, 1, k);
    let mut packed = vec![0u8; size];
    q4_gemm_pack_b(qtype, &mut packed, &src, 1, k, 1, &SerialExecutor);

    let mut dense = vec![0f32; k];
    q4_gemm_unpack_b(qtype, &mut dense, &packed, 1, k, 1);

    // Error per element must not exceed one quantization step, whatever the
    // block's scale turned out to be.
    let blk_len = qtype.blk_len();
    let blob_size = qtype.blob_size();
    for (b, chunk) in src.chunks(blk_len).enumerate() {
        let blob = &packed[b * blob_size..(b + 1) * blob_size];
        let scale = f32::from_le_bytes(blob[0..4].try_into().unwrap());
        let bound = scale.abs() + 1e-3;
        for (j, &orig) in chunk.iter().enumerate() {
            let got = dense[b * blk_len + j];
            assert!(
                (got - orig).abs() <= bound,
                "qtype={qtype:?} k={k} block={b} idx={j} orig={orig} got={got} scale={scale}"
            );
        }
    }

    // Re-packing the dequantized output must reproduce identical bytes
    // (idempotence of pack, §8) since dense already sits on quantization levels.
    let mut repacked = vec![0u8; size];
    q4_gemm_pack_b(qtype, &mut repacked, &dense, 1, k, 1, &SerialExecutor);
    assert_eq!(packed, repacked, "qtype={qtype:?} k={k}: pack(dequantize(pack(x))) != pack(x)");
});
