//! Conditioning passed through the sampler to the denoising network.
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tch::Tensor;

/// A tensor, a list, or a keyed mapping of possibly nested conditionings,
/// each tensor having the batch as leading dimension. The latent diffusion
/// models use the `c_concat` and `c_crossattn` keys.
#[derive(Debug)]
pub enum Conditioning {
    Tensor(Tensor),
    List(Vec<Conditioning>),
    Map(BTreeMap<String, Conditioning>),
}

impl From<Tensor> for Conditioning {
    fn from(xs: Tensor) -> Self {
        Self::Tensor(xs)
    }
}

impl From<Vec<Tensor>> for Conditioning {
    fn from(xs: Vec<Tensor>) -> Self {
        Self::List(xs.into_iter().map(Self::Tensor).collect())
    }
}

impl Conditioning {
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Conditioning)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Conditioning> {
        match self {
            Self::Map(map) => map.get(key),
            Self::Tensor(_) | Self::List(_) => None,
        }
    }

    /// All the tensors, in order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        match self {
            Self::Tensor(xs) => vec![xs],
            Self::List(list) => list.iter().flat_map(|c| c.tensors()).collect(),
            Self::Map(map) => map.values().flat_map(|c| c.tensors()).collect(),
        }
    }

    /// The batch size of the first tensor found when walking down the first
    /// entries.
    pub fn leading_batch_size(&self) -> Option<i64> {
        match self {
            Self::Tensor(xs) => xs.size().first().copied(),
            Self::List(list) => list.first().and_then(|c| c.leading_batch_size()),
            Self::Map(map) => map.values().next().and_then(|c| c.leading_batch_size()),
        }
    }

    /// Logs a warning for each conditioning whose batch size differs from
    /// `batch_size`. Mismatches are not corrected.
    pub fn check_batch_size(&self, batch_size: i64) {
        let warn = |got: i64| {
            log::warn!("got {got} conditionings but batch-size is {batch_size}");
        };
        match self {
            Self::List(list) => {
                for got in list.iter().filter_map(|c| c.leading_batch_size()) {
                    if got != batch_size {
                        warn(got)
                    }
                }
            }
            Self::Tensor(_) | Self::Map(_) => {
                if let Some(got) = self.leading_batch_size() {
                    if got != batch_size {
                        warn(got)
                    }
                }
            }
        }
    }

    /// Concatenates two conditionings of the same structure along the batch
    /// dimension.
    pub fn cat(&self, other: &Conditioning) -> Result<Conditioning> {
        match (self, other) {
            (Self::Tensor(lhs), Self::Tensor(rhs)) => {
                Ok(Self::Tensor(Tensor::cat(&[lhs, rhs], 0)))
            }
            (Self::List(lhs), Self::List(rhs)) if lhs.len() == rhs.len() => {
                let list = lhs.iter().zip(rhs.iter()).map(|(l, r)| l.cat(r));
                Ok(Self::List(list.collect::<Result<_>>()?))
            }
            (Self::Map(lhs), Self::Map(rhs)) if lhs.keys().eq(rhs.keys()) => {
                let mut map = BTreeMap::new();
                for ((key, l), r) in lhs.iter().zip(rhs.values()) {
                    map.insert(key.clone(), l.cat(r)?);
                }
                Ok(Self::Map(map))
            }
            _ => Err(Error::Conditioning(
                "cannot concatenate conditionings with different structures".to_string(),
            )),
        }
    }

    pub fn shallow_clone(&self) -> Conditioning {
        match self {
            Self::Tensor(xs) => Self::Tensor(xs.shallow_clone()),
            Self::List(list) => Self::List(list.iter().map(|c| c.shallow_clone()).collect()),
            Self::Map(map) => {
                Self::Map(map.iter().map(|(k, c)| (k.clone(), c.shallow_clone())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    #[test]
    fn batch_size_of_nested_map() {
        let hint = Tensor::zeros([2, 3, 8, 8], kind::FLOAT_CPU);
        let text = Tensor::zeros([3, 77, 16], kind::FLOAT_CPU);
        let cond = Conditioning::map([
            ("c_concat", Conditioning::from(vec![hint])),
            ("c_crossattn", Conditioning::from(vec![text])),
        ]);
        // Keys are ordered, the first one is c_concat.
        assert_eq!(cond.leading_batch_size(), Some(2));
        assert_eq!(cond.tensors().len(), 2);
        assert!(cond.get("c_crossattn").is_some());
        assert!(cond.get("c_adm").is_none());
        cond.check_batch_size(1);
    }

    #[test]
    fn cat_along_batch() {
        let lhs = Conditioning::map([(
            "c_crossattn",
            Conditioning::from(vec![Tensor::zeros([1, 77, 16], kind::FLOAT_CPU)]),
        )]);
        let rhs = lhs.shallow_clone();
        let both = lhs.cat(&rhs).unwrap();
        assert_eq!(both.leading_batch_size(), Some(2));

        let tensor = Conditioning::from(Tensor::zeros([1, 77, 16], kind::FLOAT_CPU));
        assert!(lhs.cat(&tensor).is_err());
    }
}
