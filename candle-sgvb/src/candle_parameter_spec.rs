/// Shape of one layer's parameter record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerSpec {
    /// weight `(n_out, n_in)` and bias `(n_out,)`
    Dense { n_in: usize, n_out: usize },
    /// per direction: input weight `(n_hidden, n_in)`, bias
    /// `(n_hidden,)`, recurrent weight `(n_hidden, n_hidden)` and the
    /// initial hidden state `(1, n_hidden)`
    Recurrent {
        n_in: usize,
        n_hidden: usize,
        bidirectional: bool,
    },
}

impl LayerSpec {
    pub fn num_parameters(&self) -> usize {
        match *self {
            Self::Dense { n_in, n_out } => n_in * n_out + n_out,
            Self::Recurrent {
                n_in,
                n_hidden,
                bidirectional,
            } => {
                let per_direction = n_in * n_hidden + n_hidden + n_hidden * n_hidden + n_hidden;
                if bidirectional {
                    2 * per_direction
                } else {
                    per_direction
                }
            }
        }
    }

    /// Width of the layer's output
    pub fn n_out(&self) -> usize {
        match *self {
            Self::Dense { n_out, .. } => n_out,
            Self::Recurrent {
                n_hidden,
                bidirectional,
                ..
            } => {
                if bidirectional {
                    2 * n_hidden
                } else {
                    n_hidden
                }
            }
        }
    }
}

/// Declared parameter layout of a network
///
/// The networks in `candle_mlp` and `candle_rnn` allocate exactly
/// these records, so `num_parameters` is the number of scalars they
/// register in a `VarMap`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSpec {
    pub layers: Vec<LayerSpec>,
    /// number of learned dropout logits (0 if rates are fixed)
    pub n_dropout: usize,
}

impl ParameterSpec {
    /// Feed-forward: `n_in -> hiddens[0] -> ... -> n_out`
    pub fn mlp(n_in: usize, hiddens: &[usize], n_out: usize) -> Self {
        let mut layers = Vec::with_capacity(hiddens.len() + 1);
        let mut n_prev = n_in;
        for &h in hiddens {
            layers.push(LayerSpec::Dense {
                n_in: n_prev,
                n_out: h,
            });
            n_prev = h;
        }
        layers.push(LayerSpec::Dense {
            n_in: n_prev,
            n_out,
        });
        Self {
            layers,
            n_dropout: 0,
        }
    }

    /// Recurrent hidden layers followed by a per-step dense output
    ///
    /// With `learned_dropout` there is one rate for the input, one
    /// per hidden layer and one for the hidden-to-output connection.
    pub fn rnn(
        n_in: usize,
        hiddens: &[usize],
        n_out: usize,
        bidirectional: bool,
        learned_dropout: bool,
    ) -> Self {
        let mut layers = Vec::with_capacity(hiddens.len() + 1);
        let mut n_prev = n_in;
        for &h in hiddens {
            let layer = LayerSpec::Recurrent {
                n_in: n_prev,
                n_hidden: h,
                bidirectional,
            };
            n_prev = layer.n_out();
            layers.push(layer);
        }
        layers.push(LayerSpec::Dense {
            n_in: n_prev,
            n_out,
        });
        Self {
            layers,
            n_dropout: if learned_dropout { hiddens.len() + 2 } else { 0 },
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(LayerSpec::num_parameters)
            .sum::<usize>()
            + self.n_dropout
    }

    /// Sum of several layouts, e.g. recognition and generation
    pub fn total<'a, I>(specs: I) -> usize
    where
        I: IntoIterator<Item = &'a ParameterSpec>,
    {
        specs.into_iter().map(ParameterSpec::num_parameters).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mlp_count() {
        // 8*4 + 4 + 4*4 + 4
        let spec = ParameterSpec::mlp(8, &[4], 4);
        assert_eq!(spec.layers.len(), 2);
        assert_eq!(spec.num_parameters(), 56);
        assert_eq!(ParameterSpec::mlp(3, &[], 2).num_parameters(), 8);
    }

    #[test]
    fn rnn_count() {
        // recurrent: 3*5 + 5 + 25 + 5 = 50; output: 5*2 + 2 = 12
        let uni = ParameterSpec::rnn(3, &[5], 2, false, false);
        assert_eq!(uni.num_parameters(), 62);

        // two directions and a (10 -> 2) output; 3 dropout logits
        let bi = ParameterSpec::rnn(3, &[5], 2, true, true);
        assert_eq!(bi.layers[1], LayerSpec::Dense { n_in: 10, n_out: 2 });
        assert_eq!(bi.num_parameters(), 100 + 22 + 3);
    }
}
