use crate::checkpoint::{Activation, Checkpoint, GraphDef, LayerDef};
use crate::{Error, Result};
use ndarray::{s, Array, Array1, Array2, Array4, ArrayD, ArrayView2, Axis, Dimension, Ix1, Ix2, Ix4};
use rand::Rng;

/// Intermediate value flowing between layers.
enum Tensor {
    /// `(samples, height, width, channels)`
    Image(Array4<f32>),
    /// `(samples, features)`
    Flat(Array2<f32>),
}

/// Shape of one sample between layers, used to check a graph before it runs.
#[derive(Clone, Copy, Debug, PartialEq)]
enum SampleShape {
    Image(usize, usize, usize),
    Flat(usize),
}

fn apply(activation: Activation, v: f32) -> f32 {
    match activation {
        Activation::Relu => v.max(0.0),
        Activation::Linear => v,
    }
}

/// 2-D convolution with "same" padding and stride 1.
pub struct Conv2d {
    /// Flattened kernel, `(kh * kw * in_channels, out_channels)`.
    kernel: Array2<f32>,
    bias: Array1<f32>,
    kh: usize,
    kw: usize,
    activation: Activation,
}

impl Conv2d {
    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, h, w, c) = x.dim();
        let (ph, pw) = (self.kh / 2, self.kw / 2);
        let patch = self.kh * self.kw * c;

        // im2col: one row per output pixel, columns ordered (dy, dx, channel)
        // to match the kernel layout.
        let mut cols = Array2::<f32>::zeros((n * h * w, patch));
        for b in 0..n {
            for y in 0..h {
                for xx in 0..w {
                    let mut row = cols.row_mut((b * h + y) * w + xx);
                    for dy in 0..self.kh {
                        let sy = y + dy;
                        if sy < ph || sy - ph >= h {
                            continue;
                        }
                        for dx in 0..self.kw {
                            let sx = xx + dx;
                            if sx < pw || sx - pw >= w {
                                continue;
                            }
                            let start = (dy * self.kw + dx) * c;
                            row.slice_mut(s![start..start + c])
                                .assign(&x.slice(s![b, sy - ph, sx - pw, ..]));
                        }
                    }
                }
            }
        }

        let mut out = cols.dot(&self.kernel);
        out += &self.bias.view().insert_axis(Axis(0));
        out.mapv_inplace(|v| apply(self.activation, v));
        let out_c = self.kernel.ncols();
        Ok(out.into_shape((n, h, w, out_c))?)
    }
}

/// Non-overlapping max pooling; trailing rows/columns that do not fill a
/// window are dropped.
pub struct MaxPool {
    size: usize,
}

impl MaxPool {
    fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let (n, h, w, c) = x.dim();
        let (oh, ow) = (h / self.size, w / self.size);
        let mut out = Array4::<f32>::from_elem((n, oh, ow, c), f32::NEG_INFINITY);
        for ((b, y, xx, ch), v) in out.indexed_iter_mut() {
            let window = x.slice(s![
                b,
                y * self.size..(y + 1) * self.size,
                xx * self.size..(xx + 1) * self.size,
                ch
            ]);
            *v = window.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        }
        out
    }
}

/// Fully connected layer.
pub struct Dense {
    weight: Array2<f32>, // in x out
    bias: Array1<f32>,
    activation: Activation,
}

impl Dense {
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight);
        y += &self.bias.view().insert_axis(Axis(0));
        y.mapv_inplace(|v| apply(self.activation, v));
        y
    }
}

pub enum Layer {
    Conv2d(Conv2d),
    MaxPool(MaxPool),
    Flatten,
    Dense(Dense),
    /// Inverted dropout driven by the keep probability fed at evaluation.
    Dropout,
}

impl Layer {
    fn forward(&self, x: Tensor, keep_prob: f32) -> Result<Tensor> {
        let out = match (self, x) {
            (Layer::Conv2d(conv), Tensor::Image(img)) => Tensor::Image(conv.forward(&img)?),
            (Layer::MaxPool(pool), Tensor::Image(img)) => Tensor::Image(pool.forward(&img)),
            (Layer::Flatten, Tensor::Image(img)) => {
                let (n, h, w, c) = img.dim();
                let flat = img
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((n, h * w * c))?;
                Tensor::Flat(flat)
            }
            (Layer::Dense(dense), Tensor::Flat(m)) => Tensor::Flat(dense.forward(&m)),
            (Layer::Dropout, Tensor::Flat(m)) => Tensor::Flat(dropout(m, keep_prob)),
            (Layer::Dropout, Tensor::Image(img)) => Tensor::Image(dropout(img, keep_prob)),
            // unreachable for graphs accepted by `ClassifierNet::from_graph`
            _ => return Err(Error::shape("layer received a tensor of the wrong rank")),
        };
        Ok(out)
    }
}

fn dropout<D: Dimension>(mut x: Array<f32, D>, keep_prob: f32) -> Array<f32, D> {
    if keep_prob >= 1.0 {
        return x;
    }
    let mut rng = rand::thread_rng();
    let scale = 1.0 / keep_prob;
    x.mapv_inplace(|v| if rng.gen::<f32>() < keep_prob { v * scale } else { 0.0 });
    x
}

/// A classifier graph restored from a checkpoint, ready to evaluate.
pub struct ClassifierNet {
    scope: String,
    input_shape: [usize; 3],
    num_classes: usize,
    layers: Vec<Layer>,
}

impl ClassifierNet {
    /// Restore the graph registered under `scope`, reading only variables
    /// that belong to it.
    pub fn from_checkpoint(checkpoint: &Checkpoint, scope: &str) -> Result<Self> {
        let graph = checkpoint.graph(scope)?;
        Self::from_graph(graph, |name| {
            if !name.starts_with(scope) {
                return Err(Error::checkpoint(format!(
                    "variable `{name}` is outside scope `{scope}`"
                )));
            }
            Ok(checkpoint.variable(name)?.to_owned())
        })
    }

    fn from_graph<F>(graph: &GraphDef, mut fetch: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<ArrayD<f32>>,
    {
        let [h, w, c] = graph.input_shape;
        if h == 0 || w == 0 || c == 0 {
            return Err(Error::shape(format!("empty input shape {:?}", graph.input_shape)));
        }
        let mut shape = SampleShape::Image(h, w, c);
        let mut layers = Vec::with_capacity(graph.layers.len());

        for (i, def) in graph.layers.iter().enumerate() {
            let (layer, next) = match (def, shape) {
                (LayerDef::Conv2d { weights, bias, activation }, SampleShape::Image(h, w, c)) => {
                    let kernel = fetch(weights.as_str())?.into_dimensionality::<Ix4>()?;
                    let (kh, kw, kin, kout) = kernel.dim();
                    if kin != c || kh % 2 == 0 || kw % 2 == 0 {
                        return Err(Error::shape(format!(
                            "layer {i}: kernel {:?} does not fit {c} input channels",
                            kernel.shape()
                        )));
                    }
                    let bias = fetch_bias(&mut fetch, bias, kout, i)?;
                    let kernel = kernel
                        .as_standard_layout()
                        .into_owned()
                        .into_shape((kh * kw * kin, kout))?;
                    let conv = Conv2d { kernel, bias, kh, kw, activation: *activation };
                    (Layer::Conv2d(conv), SampleShape::Image(h, w, kout))
                }
                (LayerDef::MaxPool { size }, SampleShape::Image(h, w, c)) => {
                    if *size == 0 || *size > h || *size > w {
                        return Err(Error::shape(format!(
                            "layer {i}: pool size {size} does not fit {h}x{w}"
                        )));
                    }
                    let next = SampleShape::Image(h / size, w / size, c);
                    (Layer::MaxPool(MaxPool { size: *size }), next)
                }
                (LayerDef::Flatten, SampleShape::Image(h, w, c)) => {
                    (Layer::Flatten, SampleShape::Flat(h * w * c))
                }
                (LayerDef::Dense { weights, bias, activation }, SampleShape::Flat(d)) => {
                    let weight = fetch(weights.as_str())?.into_dimensionality::<Ix2>()?;
                    if weight.nrows() != d {
                        return Err(Error::shape(format!(
                            "layer {i}: weights {:?} do not fit {d} inputs",
                            weight.shape()
                        )));
                    }
                    let out = weight.ncols();
                    let bias = fetch_bias(&mut fetch, bias, out, i)?;
                    let dense = Dense { weight, bias, activation: *activation };
                    (Layer::Dense(dense), SampleShape::Flat(out))
                }
                (LayerDef::Dropout, s) => (Layer::Dropout, s),
                (def, s) => {
                    return Err(Error::shape(format!(
                        "layer {i}: {def:?} cannot follow output shaped {s:?}"
                    )))
                }
            };
            layers.push(layer);
            shape = next;
        }

        if shape != SampleShape::Flat(graph.num_classes) {
            return Err(Error::shape(format!(
                "graph `{}` ends in {shape:?}, expected {} logits",
                graph.scope, graph.num_classes
            )));
        }

        Ok(Self {
            scope: graph.scope.clone(),
            input_shape: graph.input_shape,
            num_classes: graph.num_classes,
            layers,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Map flattened samples `(n, input_dim)` to logits `(n, num_classes)`.
    pub fn forward(&self, features: ArrayView2<f32>, keep_prob: f32) -> Result<Array2<f32>> {
        let n = features.nrows();
        if features.ncols() != self.input_dim() {
            return Err(Error::shape(format!(
                "expected {} features per sample, got {}",
                self.input_dim(),
                features.ncols()
            )));
        }
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(Error::invalid(format!("keep_prob {keep_prob} outside (0, 1]")));
        }

        let [h, w, c] = self.input_shape;
        let images = features.as_standard_layout().into_owned().into_shape((n, h, w, c))?;
        let mut x = Tensor::Image(images);
        for layer in &self.layers {
            x = layer.forward(x, keep_prob)?;
        }
        match x {
            Tensor::Flat(logits) => Ok(logits),
            Tensor::Image(_) => Err(Error::shape("graph did not produce flat logits")),
        }
    }
}

fn fetch_bias<F>(fetch: &mut F, name: &str, len: usize, layer: usize) -> Result<Array1<f32>>
where
    F: FnMut(&str) -> Result<ArrayD<f32>>,
{
    let bias = fetch(name)?.into_dimensionality::<Ix1>()?;
    if bias.len() != len {
        return Err(Error::shape(format!(
            "layer {layer}: bias `{name}` has {} values, expected {len}",
            bias.len()
        )));
    }
    Ok(bias)
}

/// Assembles a graph and matching randomly initialised variables, for
/// writing test and demo checkpoints.
pub struct GraphBuilder {
    scope: String,
    input_shape: [usize; 3],
    shape: SampleShape,
    layers: Vec<LayerDef>,
    variables: Vec<(String, ArrayD<f32>)>,
}

impl GraphBuilder {
    pub fn new(scope: impl Into<String>, input_shape: [usize; 3]) -> Self {
        let [h, w, c] = input_shape;
        Self {
            scope: scope.into(),
            input_shape,
            shape: SampleShape::Image(h, w, c),
            layers: Vec::new(),
            variables: Vec::new(),
        }
    }

    fn names(&self, kind: &str) -> (String, String) {
        let prefix = format!("{}{}{}", self.scope, kind, self.layers.len());
        (format!("{prefix}/weights"), format!("{prefix}/bias"))
    }

    fn random(shape: &[usize]) -> ArrayD<f32> {
        let mut rng = rand::thread_rng();
        ArrayD::from_shape_fn(shape, |_| rng.gen_range(-0.1..0.1))
    }

    /// 3x3 convolution. Only valid while the graph still holds images.
    pub fn conv2d(mut self, out_channels: usize, activation: Activation) -> Self {
        if let SampleShape::Image(h, w, c) = self.shape {
            let (weights, bias) = self.names("conv");
            self.variables.push((weights.clone(), Self::random(&[3, 3, c, out_channels])));
            self.variables.push((bias.clone(), Self::random(&[out_channels])));
            self.layers.push(LayerDef::Conv2d { weights, bias, activation });
            self.shape = SampleShape::Image(h, w, out_channels);
        }
        self
    }

    pub fn max_pool(mut self, size: usize) -> Self {
        if let SampleShape::Image(h, w, c) = self.shape {
            self.layers.push(LayerDef::MaxPool { size });
            self.shape = SampleShape::Image(h / size.max(1), w / size.max(1), c);
        }
        self
    }

    pub fn flatten(mut self) -> Self {
        if let SampleShape::Image(h, w, c) = self.shape {
            self.layers.push(LayerDef::Flatten);
            self.shape = SampleShape::Flat(h * w * c);
        }
        self
    }

    /// Fully connected layer, flattening first if needed.
    pub fn dense(mut self, units: usize, activation: Activation) -> Self {
        if let SampleShape::Image(..) = self.shape {
            self = self.flatten();
        }
        if let SampleShape::Flat(d) = self.shape {
            let (weights, bias) = self.names("fc");
            self.variables.push((weights.clone(), Self::random(&[d, units])));
            self.variables.push((bias.clone(), Self::random(&[units])));
            self.layers.push(LayerDef::Dense { weights, bias, activation });
            self.shape = SampleShape::Flat(units);
        }
        self
    }

    pub fn dropout(mut self) -> Self {
        self.layers.push(LayerDef::Dropout);
        self
    }

    /// Finish the graph. The width of the last layer becomes the class count.
    pub fn build(self) -> (GraphDef, Vec<(String, ArrayD<f32>)>) {
        let num_classes = match self.shape {
            SampleShape::Flat(d) => d,
            SampleShape::Image(h, w, c) => h * w * c,
        };
        let graph = GraphDef {
            scope: self.scope,
            input_shape: self.input_shape,
            num_classes,
            layers: self.layers,
        };
        (graph, self.variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use std::collections::HashMap;

    fn net(graph: &GraphDef, vars: Vec<(String, ArrayD<f32>)>) -> Result<ClassifierNet> {
        let vars: HashMap<_, _> = vars.into_iter().collect();
        ClassifierNet::from_graph(graph, |name| {
            vars.get(name)
                .cloned()
                .ok_or_else(|| Error::checkpoint(format!("missing {name}")))
        })
    }

    #[test]
    fn dense_forward_matches_manual() {
        let graph = GraphDef {
            scope: "m/".into(),
            input_shape: [1, 1, 2],
            num_classes: 2,
            layers: vec![LayerDef::Dense {
                weights: "m/w".into(),
                bias: "m/b".into(),
                activation: Activation::Relu,
            }],
        };
        let vars = vec![
            ("m/w".to_string(), arr2(&[[1.0_f32, -1.0], [2.0, 0.5]]).into_dyn()),
            ("m/b".to_string(), Array::from_vec(vec![0.0_f32, 1.0]).into_dyn()),
        ];
        let model = net(&graph, vars).unwrap();
        let logits = model.forward(arr2(&[[1.0_f32, 1.0]]).view(), 1.0).unwrap();
        // [1*1 + 1*2 + 0, relu(-1 + 0.5 + 1)]
        assert_eq!(logits, arr2(&[[3.0_f32, 0.5]]));
    }

    #[test]
    fn conv_with_centre_kernel_is_identity() {
        let mut kernel = Array4::<f32>::zeros((3, 3, 1, 1));
        kernel[[1, 1, 0, 0]] = 1.0;
        let conv = Conv2d {
            kernel: kernel.into_shape((9, 1)).unwrap(),
            bias: Array1::zeros(1),
            kh: 3,
            kw: 3,
            activation: Activation::Linear,
        };
        let x = Array4::from_shape_fn((2, 3, 4, 1), |(b, y, x, _)| (b * 100 + y * 10 + x) as f32);
        assert_eq!(conv.forward(&x).unwrap(), x);
    }

    #[test]
    fn conv_sums_neighbourhood_with_zero_padding() {
        let conv = Conv2d {
            kernel: Array2::ones((9, 1)),
            bias: Array1::zeros(1),
            kh: 3,
            kw: 3,
            activation: Activation::Linear,
        };
        let x = Array4::<f32>::ones((1, 3, 3, 1));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 1, 1, 0]], 9.0);
        assert_eq!(y[[0, 0, 1, 0]], 6.0);
    }

    #[test]
    fn max_pool_takes_window_maximum() {
        let x = Array4::from_shape_fn((1, 4, 5, 1), |(_, y, x, _)| (y * 5 + x) as f32);
        let y = MaxPool { size: 2 }.forward(&x);
        assert_eq!(y.dim(), (1, 2, 2, 1));
        assert_eq!(y[[0, 0, 0, 0]], 6.0);
        assert_eq!(y[[0, 1, 1, 0]], 18.0);
    }

    #[test]
    fn builder_graph_restores_and_runs() {
        let (graph, vars) = GraphBuilder::new("cnn/", [6, 6, 1])
            .conv2d(4, Activation::Relu)
            .max_pool(2)
            .dense(8, Activation::Relu)
            .dropout()
            .dense(5, Activation::Linear)
            .build();
        assert_eq!(graph.num_classes, 5);

        let model = net(&graph, vars).unwrap();
        let x = Array2::<f32>::ones((3, 36));
        let logits = model.forward(x.view(), 1.0).unwrap();
        assert_eq!(logits.dim(), (3, 5));
        // keep_prob 1.0 disables dropout, so evaluation is repeatable
        assert_eq!(logits, model.forward(x.view(), 1.0).unwrap());
    }

    #[test]
    fn dropout_scales_kept_values() {
        let graph = GraphDef {
            scope: "m/".into(),
            input_shape: [1, 1, 4],
            num_classes: 4,
            layers: vec![
                LayerDef::Flatten,
                LayerDef::Dropout,
                LayerDef::Dense {
                    weights: "m/w".into(),
                    bias: "m/b".into(),
                    activation: Activation::Linear,
                },
            ],
        };
        let vars = vec![
            ("m/w".to_string(), Array2::<f32>::eye(4).into_dyn()),
            ("m/b".to_string(), Array1::<f32>::zeros(4).into_dyn()),
        ];
        let model = net(&graph, vars).unwrap();
        let x = Array2::<f32>::ones((8, 4));
        let y = model.forward(x.view(), 0.5).unwrap();
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(model.forward(x.view(), 0.0).is_err());
    }

    #[test]
    fn dense_before_flatten_is_rejected() {
        let graph = GraphDef {
            scope: "m/".into(),
            input_shape: [2, 2, 1],
            num_classes: 2,
            layers: vec![LayerDef::Dense {
                weights: "m/w".into(),
                bias: "m/b".into(),
                activation: Activation::Linear,
            }],
        };
        let vars = vec![
            ("m/w".to_string(), Array2::<f32>::zeros((4, 2)).into_dyn()),
            ("m/b".to_string(), Array1::<f32>::zeros(2).into_dyn()),
        ];
        assert!(matches!(net(&graph, vars), Err(Error::Shape(_))));
    }

    #[test]
    fn wrong_class_count_is_rejected() {
        let (mut graph, vars) = GraphBuilder::new("m/", [2, 2, 1])
            .dense(3, Activation::Linear)
            .build();
        graph.num_classes = 4;
        assert!(matches!(net(&graph, vars), Err(Error::Shape(_))));
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let (graph, vars) = GraphBuilder::new("m/", [2, 2, 1])
            .dense(3, Activation::Linear)
            .build();
        let model = net(&graph, vars).unwrap();
        let err = model.forward(Array2::<f32>::zeros((1, 5)).view(), 1.0);
        assert!(matches!(err, Err(Error::Shape(_))));
    }
}
