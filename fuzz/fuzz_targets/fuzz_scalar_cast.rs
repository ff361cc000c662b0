#![no_main]

use groupwise::{DType, NullKind, Scalar, cast_scalar};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 10 {
        return;
    }
    let raw = i64::from_le_bytes([
        data[2], data[3], data[4], data[5], data[6], data[7], data[8], data[9],
    ]);
    let value = match data[0] % 6 {
        0 => Scalar::Null(NullKind::Null),
        1 => Scalar::Null(NullKind::NaN),
        2 => Scalar::Bool((raw & 1) == 0),
        3 => Scalar::Int64(raw),
        4 => Scalar::Float64(f64::from_bits(raw as u64)),
        _ => Scalar::Utf8(raw.to_string()),
    };
    let target = match data[1] % 5 {
        0 => DType::Null,
        1 => DType::Bool,
        2 => DType::Int64,
        3 => DType::Float64,
        _ => DType::Utf8,
    };

    let was_missing = value.is_missing();
    if let Ok(cast) = cast_scalar(value, target) {
        // A successful cast lands on the target dtype, except that missing
        // inputs become the target's missing marker.
        if was_missing || cast.is_missing() {
            assert!(cast.semantic_eq(&Scalar::missing_for_dtype(target)));
        } else {
            assert_eq!(cast.dtype(), target);
        }
    }
});
