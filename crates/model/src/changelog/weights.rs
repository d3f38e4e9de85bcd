/// Splits `total` across items proportionally to `costs` using the
/// largest-remainder method, so the result always sums to `total`.
///
/// Items with zero cost still receive a share when every cost is zero.
pub fn apportion(costs: &[u64], total: u32) -> Vec<u32> {
    if costs.is_empty() {
        return Vec::new();
    }

    let costs: Vec<u128> = if costs.iter().all(|c| *c == 0) {
        vec![1; costs.len()]
    } else {
        costs.iter().map(|c| u128::from(*c)).collect()
    };
    let sum: u128 = costs.iter().sum();
    let total_wide = u128::from(total);

    let mut shares: Vec<u32> = costs
        .iter()
        .map(|c| (c * total_wide / sum) as u32)
        .collect();

    let mut remainders: Vec<(usize, u128)> = costs
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c * total_wide % sum))
        .collect();
    // Largest remainder first; ties go to the earlier item.
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let assigned: u32 = shares.iter().sum();
    for (idx, _) in remainders.iter().take((total - assigned) as usize) {
        shares[*idx] += 1;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_to_total() {
        let shares = apportion(&[1, 1, 1], 100);
        assert_eq!(shares, vec![34, 33, 33]);
        assert_eq!(shares.iter().sum::<u32>(), 100);
    }

    #[test]
    fn proportional_to_cost() {
        assert_eq!(apportion(&[30, 10, 60], 100), vec![30, 10, 60]);
        assert_eq!(apportion(&[0, 5], 100), vec![0, 100]);
    }

    #[test]
    fn all_zero_costs_split_evenly() {
        assert_eq!(apportion(&[0, 0], 100), vec![50, 50]);
        assert!(apportion(&[], 100).is_empty());
    }
}
