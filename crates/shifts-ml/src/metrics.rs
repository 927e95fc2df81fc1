//! Speaker verification metrics

use ndarray::Array1;

/// Cosine similarity in f64 accumulation; 0.0 for empty or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Equal error rate of `scores` against same-speaker `targets`
///
/// Returns None unless both target and non-target trials exist.
pub fn compute_eer(scores: &[f32], targets: &[bool]) -> Option<f64> {
    let num_pos = targets.iter().filter(|&&t| t).count();
    let num_neg = targets.len() - num_pos;
    if num_pos == 0 || num_neg == 0 || scores.len() != targets.len() {
        return None;
    }

    let mut trials: Vec<(f32, bool)> = scores.iter().copied().zip(targets.iter().copied()).collect();
    trials.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Threshold below everything: nothing rejected
    let (mut rejected_pos, mut rejected_neg) = (0usize, 0usize);
    let mut best = (f64::INFINITY, 0.5);
    let mut consider = |rp: usize, rn: usize| {
        let frr = rp as f64 / num_pos as f64;
        let far = (num_neg - rn) as f64 / num_neg as f64;
        let gap = (frr - far).abs();
        if gap < best.0 {
            best = (gap, (frr + far) / 2.0);
        }
    };
    consider(0, 0);

    let mut i = 0;
    while i < trials.len() {
        // Ties move together
        let score = trials[i].0;
        while i < trials.len() && trials[i].0 == score {
            if trials[i].1 {
                rejected_pos += 1;
            } else {
                rejected_neg += 1;
            }
            i += 1;
        }
        consider(rejected_pos, rejected_neg);
    }

    Some(best.1)
}

/// EER over all embedding pairs, scored by cosine similarity
pub fn pairwise_eer(embeddings: &[Array1<f32>], labels: &[usize]) -> Option<f64> {
    let mut scores = Vec::new();
    let mut targets = Vec::new();
    for i in 0..embeddings.len() {
        for j in i + 1..embeddings.len() {
            let (a, b) = (&embeddings[i], &embeddings[j]);
            let score = match (a.as_slice(), b.as_slice()) {
                (Some(a), Some(b)) => cosine_similarity(a, b),
                _ => cosine_similarity(&a.to_vec(), &b.to_vec()),
            };
            scores.push(score);
            targets.push(labels[i] == labels[j]);
        }
    }
    compute_eer(&scores, &targets)
}
