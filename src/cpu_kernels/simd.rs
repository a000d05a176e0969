//! `wide`-vectorized f32 kernels.
//!
//! Eight-lane f32 ops with scalar tails; matmul parallelizes over output
//! rows once the work is large enough to amortize the fork.

use rayon::prelude::*;
use wide::f32x8;

const LANES: usize = 8;
/// Below this many output elements, rayon overhead beats the speedup.
const PAR_THRESHOLD: usize = 64 * 1024;

#[inline]
fn load(slice: &[f32], i: usize) -> f32x8 {
    f32x8::from(unsafe { *(slice.as_ptr().add(i) as *const [f32; 8]) })
}

pub fn add_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    let n = out.len();
    let main = n - n % LANES;
    let mut i = 0;
    while i < main {
        let v = load(a, i) + load(b, i);
        out[i..i + LANES].copy_from_slice(&v.to_array());
        i += LANES;
    }
    for i in main..n {
        out[i] = a[i] + b[i];
    }
}

pub fn mul_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    let n = out.len();
    let main = n - n % LANES;
    let mut i = 0;
    while i < main {
        let v = load(a, i) * load(b, i);
        out[i..i + LANES].copy_from_slice(&v.to_array());
        i += LANES;
    }
    for i in main..n {
        out[i] = a[i] * b[i];
    }
}

pub fn sum_f32(a: &[f32]) -> f32 {
    let n = a.len();
    let main = n - n % LANES;
    let mut acc = f32x8::ZERO;
    let mut i = 0;
    while i < main {
        acc += load(a, i);
        i += LANES;
    }
    let mut total: f32 = acc.to_array().iter().sum();
    for &v in &a[main..] {
        total += v;
    }
    total
}

pub fn max_f32(a: &[f32]) -> f32 {
    let n = a.len();
    let main = n - n % LANES;
    let mut best = f32::NEG_INFINITY;
    if main > 0 {
        let mut acc = load(a, 0);
        let mut i = LANES;
        while i < main {
            acc = acc.max(load(a, i));
            i += LANES;
        }
        best = acc
            .to_array()
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
    }
    for &v in &a[main..] {
        best = best.max(v);
    }
    best
}

/// Inner kernel for one output row: `out_row[j] = Σ_p a_row[p]·b[p·n+j]`.
fn matmul_row(a_row: &[f32], b: &[f32], out_row: &mut [f32], k: usize, n: usize) {
    out_row.fill(0.0);
    let main = n - n % LANES;
    for (p, &av) in a_row.iter().enumerate().take(k) {
        let avv = f32x8::splat(av);
        let b_row = &b[p * n..p * n + n];
        let mut j = 0;
        while j < main {
            let cur = load(out_row, j) + avv * load(b_row, j);
            out_row[j..j + LANES].copy_from_slice(&cur.to_array());
            j += LANES;
        }
        for j in main..n {
            out_row[j] += av * b_row[j];
        }
    }
}

pub fn matmul_f32(
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    k: usize,
    n: usize,
    row_start: usize,
    row_end: usize,
) {
    let work = (row_end - row_start) * n;
    let rows = &mut out[row_start * n..row_end * n];
    if work >= PAR_THRESHOLD {
        rows.par_chunks_mut(n)
            .enumerate()
            .for_each(|(offset, out_row)| {
                let i = row_start + offset;
                matmul_row(&a[i * k..i * k + k], b, out_row, k, n);
            });
    } else {
        for (offset, out_row) in rows.chunks_mut(n).enumerate() {
            let i = row_start + offset;
            matmul_row(&a[i * k..i * k + k], b, out_row, k, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tails_are_handled() {
        for n in [1usize, 7, 8, 9, 31, 64, 100] {
            let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
            let b: Vec<f32> = (0..n).map(|i| 2.0 * i as f32).collect();
            let mut out = vec![0f32; n];
            add_f32(&a, &b, &mut out);
            assert!(out.iter().enumerate().all(|(i, &v)| v == 3.0 * i as f32));
            assert_eq!(sum_f32(&a), (0..n).sum::<usize>() as f32);
            assert_eq!(max_f32(&a), (n - 1) as f32);
        }
    }
}
