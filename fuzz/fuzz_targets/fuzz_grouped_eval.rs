#![no_main]

use groupwise::{
    Column, Evaluator, Frame, Partition, Scalar, Value, Verb, evaluate_grouped, parse_named,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 || data.len() > 4096 {
        return;
    }
    let n_rows = usize::from(data[0] % 9);
    let cut = usize::from(data[1]) % (n_rows + 1);
    let verb = match data[2] % 4 {
        0 => Verb::Filter,
        1 => Verb::Mutate,
        2 => Verb::Summarise,
        _ => Verb::Other,
    };
    let Ok(source) = std::str::from_utf8(&data[3..]) else {
        return;
    };
    let Ok(named) = parse_named(None, source) else {
        return;
    };

    let values: Vec<Scalar> = (0..n_rows).map(|row| Scalar::Int64(row as i64 - 3)).collect();
    let Ok(column) = Column::from_values(values) else {
        return;
    };
    let Ok(frame) = Frame::new(vec![("v".to_owned(), Value::Column(column))]) else {
        return;
    };
    let Ok(partition) = Partition::grouped(vec![(0..cut).collect(), (cut..n_rows).collect()], n_rows)
    else {
        return;
    };

    let exprs = vec![named];
    let fast = evaluate_grouped(&frame, &partition, verb, &exprs, &Evaluator::new());
    let slow = evaluate_grouped(&frame, &partition, verb, &exprs, &Evaluator::without_fast_path());

    // Both tiers must agree on success, failure, and every produced value.
    match (fast, slow) {
        (Ok(lhs), Ok(rhs)) => {
            assert_eq!(lhs.names(), rhs.names());
            assert_eq!(lhs.n_groups(), rhs.n_groups());
            for group in 0..lhs.n_groups() {
                let (a, b) = (lhs.group(group), rhs.group(group));
                assert_eq!(a.len(), b.len());
                for (left, right) in a.iter().zip(b) {
                    assert!(left.semantic_eq(right), "group {group}: {left:?} != {right:?}");
                }
            }
        }
        (Err(lhs), Err(rhs)) => assert_eq!(lhs.to_string(), rhs.to_string()),
        (Ok(_), Err(err)) => panic!("vectorized tier passed where per-group tier failed: {err}"),
        (Err(err), Ok(_)) => panic!("per-group tier passed where vectorized tier failed: {err}"),
    }
});
