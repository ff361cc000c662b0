#![no_main]

use groupwise::{Column, Frame, NullKind, PartitionOptions, Scalar, Value, partition_by_keys};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let drop_missing = (data[0] & 1) == 0;
    let kind = (data[0] >> 1) % 3;
    // Bound the key column so the fuzzer stays fast.
    let values: Vec<Scalar> = data[1..]
        .iter()
        .take(512)
        .map(|&byte| {
            if byte % 7 == 0 {
                Scalar::Null(NullKind::Null)
            } else {
                match kind {
                    0 => Scalar::Int64(i64::from(byte % 16)),
                    1 => Scalar::Utf8((byte % 8).to_string()),
                    _ => Scalar::Float64(f64::from(byte % 16) / 2.0),
                }
            }
        })
        .collect();
    let n_rows = values.len();
    let Ok(column) = Column::from_values(values) else {
        return;
    };
    let Ok(frame) = Frame::new(vec![("key".to_owned(), Value::Column(column))]) else {
        return;
    };
    let Ok(keyed) = partition_by_keys(&frame, &["key"], PartitionOptions { drop_missing }) else {
        return;
    };

    // Every row lands in at most one group and stays in bounds.
    let mut seen = vec![false; n_rows];
    for group in keyed.partition().groups() {
        assert!(!group.is_empty());
        for &row in group {
            assert!(row < n_rows);
            assert!(!seen[row]);
            seen[row] = true;
        }
    }
    if !drop_missing {
        assert!(seen.iter().all(|&hit| hit));
    }
    assert_eq!(keyed.keys().n_rows(), keyed.n_groups());
});
