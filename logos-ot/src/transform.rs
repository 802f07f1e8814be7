//! Inclusion transformation of concurrent operations.
//!
//! Given two operations `a` and `b` defined on the same state,
//! [`transform`] returns `(a', b')` such that
//!
//! ```text
//! apply(apply(s, a), b')  ==  apply(apply(s, b), a')
//! ```
//!
//! Ties between two inserts at the same offset are broken by `a_first`:
//! the operation with priority keeps its offset and the other shifts past
//! it. Every site must pass the same priority for the same pair, which the
//! Jupiter state guarantees by deriving it from its [`SiteRole`].
//!
//! The transformation is total. No pair of operations fails to transform;
//! offsets near `usize::MAX` saturate instead of wrapping.
//!
//! [`SiteRole`]: crate::jupiter::SiteRole

use crate::operation::{char_len, char_slice, Operation};

/// Transform `a` and `b` against each other.
///
/// Returns `(a', b')` where `a'` is `a` re-expressed after `b` and `b'` is
/// `b` re-expressed after `a`.
pub fn transform(a: &Operation, b: &Operation, a_first: bool) -> (Operation, Operation) {
    (include(a, b, a_first), include(b, a, !a_first))
}

/// Re-express `op` in the state produced by applying `against`.
pub fn include(op: &Operation, against: &Operation, op_first: bool) -> Operation {
    if op.is_noop() {
        return Operation::NoOperation;
    }
    if against.is_noop() {
        return op.clone();
    }

    match (op, against) {
        (Operation::Split(first, second), _) => {
            let against_after_first = include(against, first, !op_first);
            Operation::split(
                include(first, against, op_first),
                include(second, &against_after_first, op_first),
            )
        }
        (_, Operation::Split(first, second)) => {
            include(&include(op, first, op_first), second, op_first)
        }
        (
            Operation::Insert { offset: pos_a, text: text_a },
            Operation::Insert { offset: pos_b, text: text_b },
        ) => {
            if *pos_a < *pos_b || (*pos_a == *pos_b && op_first) {
                Operation::insert(*pos_a, text_a.clone())
            } else {
                Operation::insert(pos_a.saturating_add(char_len(text_b)), text_a.clone())
            }
        }
        (
            Operation::Insert { offset: pos_a, text: text_a },
            Operation::Delete { offset: pos_b, text: text_b },
        ) => {
            let len_b = char_len(text_b);
            if *pos_a <= *pos_b {
                Operation::insert(*pos_a, text_a.clone())
            } else if *pos_a >= pos_b.saturating_add(len_b) {
                Operation::insert(pos_a - len_b, text_a.clone())
            } else {
                // The insertion point was deleted; land where the range collapsed.
                Operation::insert(*pos_b, text_a.clone())
            }
        }
        (
            Operation::Delete { offset: pos_a, text: text_a },
            Operation::Insert { offset: pos_b, text: text_b },
        ) => {
            let len_a = char_len(text_a);
            let len_b = char_len(text_b);
            if *pos_b >= pos_a.saturating_add(len_a) {
                Operation::delete(*pos_a, text_a.clone())
            } else if *pos_b <= *pos_a {
                Operation::delete(pos_a.saturating_add(len_b), text_a.clone())
            } else {
                // Insertion inside the deleted range survives between the halves.
                let head = pos_b - pos_a;
                Operation::split(
                    Operation::delete(*pos_a, char_slice(text_a, 0, head)),
                    Operation::delete(pos_a.saturating_add(len_b), char_slice(text_a, head, len_a)),
                )
            }
        }
        (
            Operation::Delete { offset: pos_a, text: text_a },
            Operation::Delete { offset: pos_b, text: text_b },
        ) => include_delete_delete(*pos_a, text_a, *pos_b, char_len(text_b)),
        // No-ops were handled above.
        (Operation::NoOperation, _) | (_, Operation::NoOperation) => op.clone(),
    }
}

fn include_delete_delete(pos_a: usize, text_a: &str, pos_b: usize, len_b: usize) -> Operation {
    let len_a = char_len(text_a);
    let end_a = pos_a.saturating_add(len_a);
    let end_b = pos_b.saturating_add(len_b);

    if end_a <= pos_b {
        return Operation::delete(pos_a, text_a);
    }
    if pos_a >= end_b {
        return Operation::delete(pos_a - len_b, text_a);
    }

    // Overlap: keep only the part of `a` that `b` left behind.
    if pos_b <= pos_a && end_a <= end_b {
        Operation::NoOperation
    } else if pos_b <= pos_a {
        Operation::delete(pos_b, char_slice(text_a, end_b - pos_a, len_a))
    } else if end_b >= end_a {
        Operation::delete(pos_a, char_slice(text_a, 0, pos_b - pos_a))
    } else {
        let mut rest = char_slice(text_a, 0, pos_b - pos_a);
        rest.push_str(&char_slice(text_a, end_b - pos_a, len_a));
        Operation::delete(pos_a, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converge(base: &str, a: Operation, b: Operation, a_first: bool) -> String {
        let (a2, b2) = transform(&a, &b, a_first);

        let mut left = base.to_string();
        a.apply(&mut left).unwrap();
        b2.apply(&mut left).unwrap();

        let mut right = base.to_string();
        b.apply(&mut right).unwrap();
        a2.apply(&mut right).unwrap();

        assert_eq!(left, right, "diverged for a={a:?} b={b:?}");
        left
    }

    #[test]
    fn test_insert_insert_tie_break() {
        assert_eq!(
            converge("abc", Operation::insert(1, "X"), Operation::insert(1, "Y"), true),
            "aXYbc"
        );
        assert_eq!(
            converge("abc", Operation::insert(1, "X"), Operation::insert(1, "Y"), false),
            "aYXbc"
        );
    }

    #[test]
    fn test_insert_before_and_after() {
        assert_eq!(
            converge("abcdef", Operation::insert(0, "X"), Operation::insert(4, "YY"), false),
            "XabcdYYef"
        );
    }

    #[test]
    fn test_insert_inside_delete() {
        let a = Operation::insert(3, "X");
        let b = Operation::delete(1, "bcd");
        assert_eq!(include(&a, &b, true), Operation::insert(1, "X"));
        assert_eq!(converge("abcdef", a, b, true), "aXef");
    }

    #[test]
    fn test_delete_split_by_insert() {
        let a = Operation::delete(1, "bcd");
        let b = Operation::insert(2, "XY");
        assert_eq!(
            include(&a, &b, false),
            Operation::split(Operation::delete(1, "b"), Operation::delete(3, "cd"))
        );
        assert_eq!(converge("abcdef", a, b, false), "aXYef");
    }

    #[test]
    fn test_insert_at_delete_boundaries() {
        assert_eq!(
            converge("abcdef", Operation::insert(1, "X"), Operation::delete(1, "bc"), true),
            "aXdef"
        );
        assert_eq!(
            converge("abcdef", Operation::insert(3, "X"), Operation::delete(1, "bc"), false),
            "aXdef"
        );
    }

    #[test]
    fn test_overlapping_deletes() {
        assert_eq!(
            converge("abcdefgh", Operation::delete(1, "bcd"), Operation::delete(2, "cdef"), true),
            "agh"
        );
        assert_eq!(
            converge("abcdefgh", Operation::delete(2, "cd"), Operation::delete(1, "bcdef"), true),
            "agh"
        );
        assert_eq!(
            converge("abcdefgh", Operation::delete(1, "bcdefg"), Operation::delete(3, "de"), false),
            "ah"
        );
        assert_eq!(
            include(&Operation::delete(2, "cd"), &Operation::delete(1, "bcde"), true),
            Operation::NoOperation
        );
    }

    #[test]
    fn test_disjoint_deletes() {
        assert_eq!(
            converge("abcdefgh", Operation::delete(0, "ab"), Operation::delete(5, "fg"), true),
            "cdeh"
        );
    }

    #[test]
    fn test_split_against_operation() {
        let a = Operation::split(Operation::delete(0, "ab"), Operation::insert(2, "Z"));
        let b = Operation::insert(1, "Q");
        assert_eq!(converge("abcdef", a, b, true), "QcdZef");
    }

    #[test]
    fn test_operation_against_split() {
        let a = Operation::delete(2, "cdef");
        let b = Operation::split(Operation::insert(3, "X"), Operation::delete(0, "a"));
        assert_eq!(converge("abcdefg", a, b, false), "bXg");
    }

    /// Every insert, delete and delete-then-insert split on `base`.
    fn all_operations(base: &str) -> Vec<Operation> {
        let len = char_len(base);
        let mut ops = Vec::new();
        for pos in 0..=len {
            ops.push(Operation::insert(pos, "x"));
            ops.push(Operation::insert(pos, "yz"));
        }
        for start in 0..len {
            for end in start + 1..=len {
                let removed = char_slice(base, start, end);
                ops.push(Operation::delete(start, removed.clone()));
                for pos in 0..=len - (end - start) {
                    ops.push(Operation::split(
                        Operation::delete(start, removed.clone()),
                        Operation::insert(pos, "Q"),
                    ));
                }
            }
        }
        ops
    }

    #[test]
    fn test_every_pair_converges() {
        let base = "abc";
        let ops = all_operations(base);
        for a in &ops {
            for b in &ops {
                for a_first in [true, false] {
                    converge(base, a.clone(), b.clone(), a_first);
                }
            }
        }
    }

    #[test]
    fn test_huge_offsets_saturate() {
        let far = Operation::delete(usize::MAX - 1, "xy");
        let (a2, b2) = transform(&far, &Operation::insert(0, "abc"), true);
        assert_eq!(a2, Operation::delete(usize::MAX, "xy"));
        assert_eq!(b2, Operation::insert(0, "abc"));

        let far_insert = Operation::insert(usize::MAX, "q");
        assert_eq!(
            include(&far_insert, &Operation::insert(1, "zz"), false),
            Operation::insert(usize::MAX, "q")
        );
        assert_eq!(
            include(&Operation::delete(3, "ab"), &far, true),
            Operation::delete(3, "ab")
        );
    }

    #[test]
    fn test_noop_is_identity() {
        let a = Operation::insert(2, "x");
        let (a2, b2) = transform(&a, &Operation::NoOperation, true);
        assert_eq!(a2, a);
        assert_eq!(b2, Operation::NoOperation);
    }
}
