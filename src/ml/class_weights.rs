//! クラス不均衡補正用の重み
//!
//! `w_c = N / (K * n_c)`（N: 総サンプル数, K: クラス数, n_c: クラスcのサンプル数）

use crate::error::{FreshError, Result};

/// 学習サンプルのラベル列からクラスごとの重みを計算
///
/// サンプルが1枚もないクラスがある場合は重みが定義できないためエラーにします。
pub fn compute_class_weights(labels: &[usize], num_classes: usize) -> Result<Vec<f32>> {
    if num_classes == 0 {
        return Err(FreshError::Configuration("num_classes must be positive".to_string()));
    }

    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        let slot = counts.get_mut(label).ok_or_else(|| {
            FreshError::Configuration(format!(
                "label {} is out of range for {} classes",
                label, num_classes
            ))
        })?;
        *slot += 1;
    }

    let empty: Vec<usize> = counts
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(i, _)| i)
        .collect();
    if !empty.is_empty() {
        return Err(FreshError::Configuration(format!(
            "classes without training samples: {:?}",
            empty
        )));
    }

    let total = labels.len() as f64;
    let k = num_classes as f64;
    Ok(counts
        .iter()
        .map(|&n| (total / (k * n as f64)) as f32)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_from_counts(counts: &[usize]) -> Vec<usize> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(class, &n)| std::iter::repeat(class).take(n))
            .collect()
    }

    #[test]
    fn test_balanced_property() {
        let labels = labels_from_counts(&[100, 10]);
        let weights = compute_class_weights(&labels, 2).unwrap();
        assert!(weights[0] < weights[1]);
        assert!((weights[0] * 100.0 - weights[1] * 10.0).abs() < 1e-3);
        assert!((weights[0] - 110.0 / 200.0).abs() < 1e-6);
        assert!((weights[1] - 110.0 / 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_distribution_gives_ones() {
        let labels = labels_from_counts(&[7, 7, 7]);
        let weights = compute_class_weights(&labels, 3).unwrap();
        assert!(weights.iter().all(|w| (w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_absent_class_is_rejected() {
        let labels = labels_from_counts(&[5, 0, 3]);
        let err = compute_class_weights(&labels, 3).unwrap_err();
        assert!(matches!(err, FreshError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_label() {
        assert!(compute_class_weights(&[0, 1, 2], 2).is_err());
    }
}
