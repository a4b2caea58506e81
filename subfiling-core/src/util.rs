// vim: tw=80
//! Common utility functions used throughout subfiling

use crate::types::*;

/// Number of decimal digits needed to print `n`.  Zero needs one digit.
pub fn num_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Expand the sizes array of a vector I/O request to one entry per address.
///
/// A size of zero at any index but the first means "use the previous size for
/// this and every subsequent entry".  Missing trailing entries are treated the
/// same way.
pub fn expand_sizes(sizes: &[usize], count: usize) -> Result<Vec<usize>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let first = *sizes.first().ok_or(Error::EINVAL)?;
    let mut expanded = Vec::with_capacity(count);
    expanded.push(first);
    let mut repeat = false;
    for i in 1..count {
        let prev = expanded[i - 1];
        if repeat {
            expanded.push(prev);
            continue;
        }
        match sizes.get(i) {
            Some(0) | None => {
                repeat = true;
                expanded.push(prev);
            }
            Some(&s) => expanded.push(s)
        }
    }
    Ok(expanded)
}

// LCOV_EXCL_STOP
