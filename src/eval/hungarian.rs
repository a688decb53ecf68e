//! Minimum-cost assignment (Kuhn-Munkres with potentials)

use ndarray::Array2;

/// Solve the rectangular assignment problem on a cost matrix with
/// `nrows <= ncols`, minimizing total cost in O(n²m).
///
/// Returns one `(row, col)` pair per row, sorted by row, with distinct
/// columns.
pub fn linear_sum_assignment(cost: &Array2<f64>) -> Vec<(usize, usize)> {
    let n = cost.nrows();
    let m = cost.ncols();
    assert!(n > 0, "empty cost matrix");
    assert!(
        n <= m,
        "need at least as many columns as rows, got {n}x{m}"
    );

    // 1-based potentials; p[j] is the row matched to column j (0 = free)
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // augment along the found path
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn total_cost(cost: &Array2<f64>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| cost[[r, c]]).sum()
    }

    #[test]
    fn test_identity_is_optimal() {
        let cost = arr2(&[[0.0, 1.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 0.0]]);
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_classic_3x3() {
        // known optimum: rows take cols (1, 0, 2) with cost 1+2+2 = 5
        let cost = arr2(&[[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]]);
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(total_cost(&cost, &pairs), 5.0);
    }

    #[test]
    fn test_rectangular_picks_cheap_columns() {
        let cost = arr2(&[[10.0, 1.0, 10.0, 10.0], [10.0, 10.0, 10.0, 2.0]]);
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs, vec![(0, 1), (1, 3)]);
    }

    #[test]
    fn test_columns_are_distinct() {
        let cost = arr2(&[[1.0, 2.0], [1.0, 2.0]]);
        let pairs = linear_sum_assignment(&cost);
        assert_ne!(pairs[0].1, pairs[1].1);
    }

    #[test]
    fn test_beats_greedy() {
        // greedy row-by-row would take (0,0)=1 then force (1,1)=10 (total 11);
        // the optimum is (0,1)+(1,0) = 2+2 = 4
        let cost = arr2(&[[1.0, 2.0], [2.0, 10.0]]);
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(total_cost(&cost, &pairs), 4.0);
    }

    #[test]
    #[should_panic(expected = "columns as rows")]
    fn test_rejects_wide_rows() {
        let cost = arr2(&[[1.0], [2.0]]);
        linear_sum_assignment(&cost);
    }
}
