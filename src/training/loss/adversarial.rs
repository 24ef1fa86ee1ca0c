//! Least-squares GAN objectives

use candle_core::{Tensor, D};

use crate::error::{Error, Result};

fn mean_square_distance(scores: &Tensor, target: f64) -> Result<Tensor> {
    Ok((scores - target)?.sqr()?.mean_all()?)
}

fn sum_terms(terms: Vec<Tensor>) -> Result<Tensor> {
    let count = terms.len();
    if count == 0 {
        return Err(Error::training("no discriminator scores to compare"));
    }
    Ok(Tensor::stack(&terms, 0)?.sum(D::Minus1)?)
}

/// `Σ mean((D(real) - 1)²) + mean(D(fake)²)` over sub-discriminators
pub fn discriminator_loss(real: &[Tensor], fake: &[Tensor]) -> Result<Tensor> {
    if real.len() != fake.len() {
        return Err(Error::training("real and generated score counts differ"));
    }
    let terms = real
        .iter()
        .zip(fake)
        .map(|(r, f)| Ok((mean_square_distance(r, 1.0)? + mean_square_distance(f, 0.0)?)?))
        .collect::<Result<Vec<_>>>()?;
    sum_terms(terms)
}

/// `Σ mean((D(fake) - 1)²)` over sub-discriminators
pub fn generator_loss(fake: &[Tensor]) -> Result<Tensor> {
    let terms = fake
        .iter()
        .map(|f| mean_square_distance(f, 1.0))
        .collect::<Result<Vec<_>>>()?;
    sum_terms(terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn scores(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_perfect_discriminator_has_zero_loss() {
        let real = vec![scores(&[1.0, 1.0]), scores(&[1.0])];
        let fake = vec![scores(&[0.0, 0.0]), scores(&[0.0])];
        let loss = discriminator_loss(&real, &fake).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_generator_loss_sums_sub_discriminators() {
        let fake = vec![scores(&[0.0, 0.0]), scores(&[3.0])];
        let loss = generator_loss(&fake).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 5.0);
    }

    #[test]
    fn test_mismatched_scores_are_rejected() {
        assert!(discriminator_loss(&[scores(&[1.0])], &[]).is_err());
        assert!(generator_loss(&[]).is_err());
    }
}
