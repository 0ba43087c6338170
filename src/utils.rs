use crate::detection::BBox;

/// Intersection over union of two corner-format boxes.
pub fn compute_iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter_area;

    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine distance `1 - a.b` for unit vectors. Mismatched lengths are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }
    1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
}

/// Chi-square 0.95 quantile for 1..=9 degrees of freedom.
pub fn chi2inv95(n_dof: usize) -> f32 {
    match n_dof {
        1 => 3.8415,
        2 => 5.9915,
        3 => 7.8147,
        4 => 9.4877,
        5 => 11.070,
        6 => 12.592,
        7 => 14.067,
        8 => 15.507,
        9 => 16.919,
        _ => f32::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0, 1.0);
        assert_relative_eq!(compute_iou(&a, &b), 50.0 / 150.0);
        assert_relative_eq!(compute_iou(&a, &a), 1.0);
        let far = BBox::new(100.0, 100.0, 110.0, 110.0, 1.0);
        assert_eq!(compute_iou(&a, &far), 0.0);
        let empty = BBox::new(0.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(compute_iou(&empty, &empty), 0.0);
    }

    #[test]
    fn test_cosine_distance() {
        let mut a = vec![3.0, 4.0];
        l2_normalize(&mut a);
        assert_relative_eq!(a[0], 0.6);
        assert_relative_eq!(cosine_distance(&a, &a), 0.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 1.0]), 1.0);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), 2.0);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_chi2inv95() {
        assert!(chi2inv95(1) > 0.0);
        assert!(chi2inv95(2) > chi2inv95(1));
        assert!(chi2inv95(3) > chi2inv95(2));
        assert!(chi2inv95(4) > chi2inv95(3));
        assert!(chi2inv95(10).is_infinite());
    }
}
