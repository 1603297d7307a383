#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use ft_core::{DType, DenseTensor, Device, MemoryFormat, TensorMetaError};
use ft_kernel_cpu::{
    ArgReduce, BagMode, BinaryOp, KernelError, ReduceOp, UnaryOp, arg_reduce, binary, bmm, cat,
    clone_with_format, cumsum, embedding, embedding_bag, extreme_along, index_put, linear,
    masked_select, matmul, mvlgamma, polygamma, reduce, rms_norm, softmax, stack, threshold,
    to_dtype_device, transpose, unary, unsqueeze,
};
use ft_nested::{DimArg, JaggedTensor};

/// Dense tensor argument with an optional batch-axis marker.
///
/// The marker names the dim that indexes batch items, so a per-item
/// decomposition can slice the operand alongside a jagged input.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub tensor: DenseTensor,
    pub batch_dim: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    DType(DType),
    Device(Device),
    MemoryFormat(MemoryFormat),
    Tensor(TensorArg),
    Nested(JaggedTensor),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

pub type Kwargs = BTreeMap<String, Value>;

impl Value {
    #[must_use]
    pub fn tensor(tensor: DenseTensor) -> Self {
        Self::Tensor(TensorArg {
            tensor,
            batch_dim: None,
        })
    }

    /// Dense operand sliced along `batch_dim` during per-item decomposition.
    #[must_use]
    pub fn batched(tensor: DenseTensor, batch_dim: usize) -> Self {
        Self::Tensor(TensorArg {
            tensor,
            batch_dim: Some(batch_dim),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::IntList(_) => "int_list",
            Self::DType(_) => "dtype",
            Self::Device(_) => "device",
            Self::MemoryFormat(_) => "memory_format",
            Self::Tensor(_) => "tensor",
            Self::Nested(_) => "nested",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&DenseTensor> {
        match self {
            Self::Tensor(arg) => Some(&arg.tensor),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_nested(&self) -> Option<&JaggedTensor> {
        match self {
            Self::Nested(nt) => Some(nt),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_nested(&self) -> bool {
        matches!(self, Self::Nested(_))
    }

    /// Elements of a `List` or `Tuple`.
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_dim_arg(&self) -> Option<DimArg> {
        match self {
            Self::Int(dim) => Some(DimArg::Single(*dim)),
            Self::IntList(dims) => Some(DimArg::List(dims.clone())),
            _ => None,
        }
    }

    /// Rebuilds the value bottom-up, replacing leaves through `f`.
    pub fn try_map_leaves<E>(
        &self,
        f: &mut impl FnMut(&Value) -> Result<Value, E>,
    ) -> Result<Value, E> {
        match self {
            Self::List(items) => Ok(Self::List(
                items
                    .iter()
                    .map(|item| item.try_map_leaves(f))
                    .collect::<Result<_, _>>()?,
            )),
            Self::Tuple(items) => Ok(Self::Tuple(
                items
                    .iter()
                    .map(|item| item.try_map_leaves(f))
                    .collect::<Result<_, _>>()?,
            )),
            leaf => f(leaf),
        }
    }
}

impl From<DimArg> for Value {
    fn from(value: DimArg) -> Self {
        match value {
            DimArg::Single(dim) => Self::Int(dim),
            DimArg::List(dims) => Self::IntList(dims),
        }
    }
}

impl From<DenseTensor> for Value {
    fn from(value: DenseTensor) -> Self {
        Self::tensor(value)
    }
}

impl From<JaggedTensor> for Value {
    fn from(value: JaggedTensor) -> Self {
        Self::Nested(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Kernel(KernelError),
    MissingArgument {
        op: &'static str,
        name: &'static str,
    },
    InvalidArgument {
        op: &'static str,
        name: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    NestedInput {
        op: &'static str,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::MissingArgument { op, name } => {
                write!(f, "{op}: missing required argument '{name}'")
            }
            Self::InvalidArgument {
                op,
                name,
                expected,
                found,
            } => write!(f, "{op}: argument '{name}' expected {expected}, found {found}"),
            Self::NestedInput { op } => write!(
                f,
                "{op}: dense kernel received a jagged tensor; unbind it before dispatch"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<TensorMetaError> for DispatchError {
    fn from(value: TensorMetaError) -> Self {
        Self::Kernel(KernelError::Meta(value))
    }
}

/// Closed classification attached to each catalog entry at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCategory {
    UnaryElementwise,
    BinaryElementwise,
    Reduction,
    Unclassified,
}

pub type OpFn = fn(&Value, &[Value], &Kwargs) -> Result<Value, DispatchError>;

#[derive(Clone, Copy)]
pub enum OpKernel {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Reduce(ReduceOp),
    Custom { name: &'static str, call: OpFn },
}

impl OpKernel {
    #[must_use]
    pub fn kernel_name(&self) -> String {
        match self {
            Self::Unary(op) => format!("cpu::unary::{}", op.name()),
            Self::Binary(op) => format!("cpu::binary::{}", op.name()),
            Self::Reduce(op) => format!("cpu::reduce::{}", op.name()),
            Self::Custom { name, .. } => format!("cpu::{name}"),
        }
    }

    pub fn call(
        &self,
        input: &Value,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Value, DispatchError> {
        match self {
            Self::Unary(op) => {
                let input = dense(op.name(), "input", input)?;
                Ok(Value::tensor(unary(input, *op)?))
            }
            Self::Binary(op) => {
                let lhs = dense(op.name(), "input", input)?;
                let rhs = required(op.name(), "other", args.first().or(kwargs.get("other")))?;
                let rhs = dense(op.name(), "other", rhs)?;
                Ok(Value::tensor(binary(lhs, rhs, *op)?))
            }
            Self::Reduce(op) => {
                let input = dense(op.name(), "input", input)?;
                let dims = optional_dims(op.name(), kwargs)?;
                let keepdim = optional_bool(op.name(), "keepdim", kwargs)?.unwrap_or(false);
                Ok(Value::tensor(reduce(input, *op, dims.as_deref(), keepdim)?))
            }
            Self::Custom { call, .. } => call(input, args, kwargs),
        }
    }
}

impl fmt::Debug for OpKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kernel_name())
    }
}

/// One catalog entry: a named operation, its category, and the kernel that runs it.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub name: &'static str,
    pub variant_name: &'static str,
    pub category: OpCategory,
    pub op: OpKernel,
}

impl OpInfo {
    #[must_use]
    pub const fn new(
        name: &'static str,
        variant_name: &'static str,
        category: OpCategory,
        op: OpKernel,
    ) -> Self {
        Self {
            name,
            variant_name,
            category,
            op,
        }
    }

    /// `name` or `name.variant_name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.variant_name.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.name, self.variant_name)
        }
    }

    /// Same entry with another kernel.
    #[must_use]
    pub fn with_op(&self, op: OpKernel) -> Self {
        Self {
            op,
            ..self.clone()
        }
    }

    pub fn call(
        &self,
        input: &Value,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Value, DispatchError> {
        self.op.call(input, args, kwargs)
    }
}

fn dense<'a>(
    op: &'static str,
    name: &'static str,
    value: &'a Value,
) -> Result<&'a DenseTensor, DispatchError> {
    match value {
        Value::Tensor(arg) => Ok(&arg.tensor),
        Value::Nested(_) => Err(DispatchError::NestedInput { op }),
        other => Err(DispatchError::InvalidArgument {
            op,
            name,
            expected: "tensor",
            found: other.kind(),
        }),
    }
}

fn required<'a>(
    op: &'static str,
    name: &'static str,
    value: Option<&'a Value>,
) -> Result<&'a Value, DispatchError> {
    match value {
        Some(Value::None) | None => Err(DispatchError::MissingArgument { op, name }),
        Some(value) => Ok(value),
    }
}

fn present<'a>(kwargs: &'a Kwargs, name: &str) -> Option<&'a Value> {
    kwargs.get(name).filter(|value| !matches!(value, Value::None))
}

fn optional_dense<'a>(
    op: &'static str,
    name: &'static str,
    kwargs: &'a Kwargs,
) -> Result<Option<&'a DenseTensor>, DispatchError> {
    present(kwargs, name)
        .map(|value| dense(op, name, value))
        .transpose()
}

fn optional_bool(
    op: &'static str,
    name: &'static str,
    kwargs: &Kwargs,
) -> Result<Option<bool>, DispatchError> {
    match present(kwargs, name) {
        None => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(other) => Err(DispatchError::InvalidArgument {
            op,
            name,
            expected: "bool",
            found: other.kind(),
        }),
    }
}

fn int_value(op: &'static str, name: &'static str, value: &Value) -> Result<i64, DispatchError> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(DispatchError::InvalidArgument {
            op,
            name,
            expected: "int",
            found: other.kind(),
        }),
    }
}

fn number_value(op: &'static str, name: &'static str, value: &Value) -> Result<f64, DispatchError> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v),
        other => Err(DispatchError::InvalidArgument {
            op,
            name,
            expected: "number",
            found: other.kind(),
        }),
    }
}

fn optional_dims(op: &'static str, kwargs: &Kwargs) -> Result<Option<Vec<i64>>, DispatchError> {
    match present(kwargs, "dim") {
        None => Ok(None),
        Some(Value::Int(dim)) => Ok(Some(vec![*dim])),
        Some(Value::IntList(dims)) => Ok(Some(dims.clone())),
        Some(other) => Err(DispatchError::InvalidArgument {
            op,
            name: "dim",
            expected: "int or int list",
            found: other.kind(),
        }),
    }
}

fn optional_dim(op: &'static str, kwargs: &Kwargs) -> Result<Option<i64>, DispatchError> {
    present(kwargs, "dim")
        .map(|value| int_value(op, "dim", value))
        .transpose()
}

fn tensor_list(
    op: &'static str,
    name: &'static str,
    value: &Value,
) -> Result<Vec<DenseTensor>, DispatchError> {
    let items = value.as_sequence().ok_or(DispatchError::InvalidArgument {
        op,
        name,
        expected: "list of tensors",
        found: value.kind(),
    })?;
    items
        .iter()
        .map(|item| dense(op, name, item).cloned())
        .collect()
}

fn usize_list(op: &'static str, name: &'static str, value: &Value) -> Result<Vec<usize>, DispatchError> {
    let invalid = || DispatchError::InvalidArgument {
        op,
        name,
        expected: "list of non-negative ints",
        found: value.kind(),
    };
    match value {
        Value::IntList(items) => items
            .iter()
            .map(|&v| usize::try_from(v).map_err(|_| invalid()))
            .collect(),
        Value::Tensor(arg) if arg.tensor.dtype() == DType::I64 => arg
            .tensor
            .to_vec()
            .into_iter()
            .map(|v| if v >= 0.0 { Ok(v as usize) } else { Err(invalid()) })
            .collect(),
        _ => Err(invalid()),
    }
}

fn extreme_with_dim(
    op: &'static str,
    which: ArgReduce,
    input: &Value,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    let tensor = dense(op, "input", input)?;
    let dim = match args.first().or(present(kwargs, "dim")) {
        Some(value) => Some(int_value(op, "dim", value)?),
        None => None,
    };
    let keepdim = optional_bool(op, "keepdim", kwargs)?.unwrap_or(false);
    match dim {
        Some(dim) => {
            let (values, indices) = extreme_along(tensor, which, dim, keepdim)?;
            Ok(Value::Tuple(vec![Value::tensor(values), Value::tensor(indices)]))
        }
        None => {
            let full = match which {
                ArgReduce::Max => ReduceOp::Amax,
                ArgReduce::Min => ReduceOp::Amin,
            };
            Ok(Value::tensor(reduce(tensor, full, None, false)?))
        }
    }
}

fn max_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    extreme_with_dim("max", ArgReduce::Max, input, args, kwargs)
}

fn min_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    extreme_with_dim("min", ArgReduce::Min, input, args, kwargs)
}

fn arg_extreme(
    op: &'static str,
    which: ArgReduce,
    input: &Value,
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    let tensor = dense(op, "input", input)?;
    let dim = optional_dim(op, kwargs)?;
    let keepdim = optional_bool(op, "keepdim", kwargs)?.unwrap_or(false);
    Ok(Value::tensor(arg_reduce(tensor, which, dim, keepdim)?))
}

fn argmax_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    arg_extreme("argmax", ArgReduce::Max, input, kwargs)
}

fn argmin_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    arg_extreme("argmin", ArgReduce::Min, input, kwargs)
}

fn prod_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    OpKernel::Reduce(ReduceOp::Prod).call(input, &[], kwargs)
}

fn second_operand<'a>(
    op: &'static str,
    name: &'static str,
    args: &'a [Value],
    kwargs: &'a Kwargs,
) -> Result<&'a DenseTensor, DispatchError> {
    let value = required(op, name, args.first().or(kwargs.get(name)))?;
    dense(op, name, value)
}

/// Dense `matmul(input, other)`.
pub fn matmul_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let lhs = dense("matmul", "input", input)?;
    let rhs = second_operand("matmul", "other", args, kwargs)?;
    Ok(Value::tensor(matmul(lhs, rhs)?))
}

fn bmm_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let lhs = dense("bmm", "input", input)?;
    let rhs = second_operand("bmm", "mat2", args, kwargs)?;
    Ok(Value::tensor(bmm(lhs, rhs)?))
}

fn clone_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("clone", "input", input)?;
    let memory_format = match present(kwargs, "memory_format") {
        None => MemoryFormat::Preserve,
        Some(Value::MemoryFormat(format)) => *format,
        Some(other) => {
            return Err(DispatchError::InvalidArgument {
                op: "clone",
                name: "memory_format",
                expected: "memory_format",
                found: other.kind(),
            });
        }
    };
    Ok(Value::tensor(clone_with_format(tensor, memory_format)))
}

fn to_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("to", "input", input)?;
    let dtype = match present(kwargs, "dtype") {
        None => None,
        Some(Value::DType(dtype)) => Some(*dtype),
        Some(other) => {
            return Err(DispatchError::InvalidArgument {
                op: "to",
                name: "dtype",
                expected: "dtype",
                found: other.kind(),
            });
        }
    };
    let device = match present(kwargs, "device") {
        None => None,
        Some(Value::Device(device)) => Some(*device),
        Some(other) => {
            return Err(DispatchError::InvalidArgument {
                op: "to",
                name: "device",
                expected: "device",
                found: other.kind(),
            });
        }
    };
    Ok(Value::tensor(to_dtype_device(tensor, dtype, device)))
}

fn masked_select_op(
    input: &Value,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    let tensor = dense("masked_select", "input", input)?;
    let mask = second_operand("masked_select", "mask", args, kwargs)?;
    Ok(Value::tensor(masked_select(tensor, mask)?))
}

fn index_put_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("index_put", "input", input)?;
    let indices = tensor_list(
        "index_put",
        "indices",
        required("index_put", "indices", kwargs.get("indices"))?,
    )?;
    let values = dense(
        "index_put",
        "values",
        required("index_put", "values", kwargs.get("values"))?,
    )?;
    let accumulate = optional_bool("index_put", "accumulate", kwargs)?.unwrap_or(false);
    Ok(Value::tensor(index_put(tensor, &indices, values, accumulate)?))
}

/// Catalog form of embedding: weight first, indices second.
fn embedding_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let weight = dense("nn.functional.embedding", "weight", input)?;
    let indices = second_operand("nn.functional.embedding", "input", args, kwargs)?;
    let padding_idx = present(kwargs, "padding_idx")
        .map(|value| int_value("nn.functional.embedding", "padding_idx", value))
        .transpose()?;
    Ok(Value::tensor(embedding(indices, weight, padding_idx)?))
}

fn bag_call(
    indices: &DenseTensor,
    weight: &DenseTensor,
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    const OP: &str = "nn.functional.embedding_bag";
    let mode = match present(kwargs, "mode") {
        None => BagMode::Mean,
        Some(Value::Str(mode)) => BagMode::parse(mode)?,
        Some(other) => {
            return Err(DispatchError::InvalidArgument {
                op: OP,
                name: "mode",
                expected: "str",
                found: other.kind(),
            });
        }
    };
    let per_sample_weights = optional_dense(OP, "per_sample_weights", kwargs)?;
    let out = match present(kwargs, "offsets") {
        Some(offsets) => {
            let offsets = usize_list(OP, "offsets", offsets)?;
            embedding_bag(indices, weight, &offsets, mode, per_sample_weights)?
        }
        None if indices.rank() == 2 => {
            let (bags, width) = (indices.shape()[0], indices.shape()[1]);
            let flat = indices.reshape(vec![bags * width])?;
            let flat_weights = per_sample_weights
                .map(|w| w.reshape(vec![bags * width]))
                .transpose()?;
            let offsets: Vec<usize> = (0..bags).map(|bag| bag * width).collect();
            embedding_bag(&flat, weight, &offsets, mode, flat_weights.as_ref())?
        }
        None => return Err(DispatchError::MissingArgument { op: OP, name: "offsets" }),
    };
    Ok(Value::tensor(out))
}

/// Catalog form of embedding_bag: weight first, indices second.
fn embedding_bag_op(
    input: &Value,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    let weight = dense("nn.functional.embedding_bag", "weight", input)?;
    let indices = second_operand("nn.functional.embedding_bag", "input", args, kwargs)?;
    bag_call(indices, weight, kwargs)
}

/// Functional form of embedding_bag: indices first, weight second.
pub fn functional_embedding_bag(
    input: &Value,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<Value, DispatchError> {
    let indices = dense("nn.functional.embedding_bag", "input", input)?;
    let weight = second_operand("nn.functional.embedding_bag", "weight", args, kwargs)?;
    bag_call(indices, weight, kwargs)
}

fn linear_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("nn.functional.linear", "input", input)?;
    let weight = second_operand("nn.functional.linear", "weight", args, kwargs)?;
    let bias = optional_dense("nn.functional.linear", "bias", kwargs)?;
    Ok(Value::tensor(linear(tensor, weight, bias)?))
}

fn rms_norm_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    const OP: &str = "nn.functional.rms_norm";
    let tensor = dense(OP, "input", input)?;
    let normalized_shape = usize_list(
        OP,
        "normalized_shape",
        required(OP, "normalized_shape", kwargs.get("normalized_shape"))?,
    )?;
    let weight = optional_dense(OP, "weight", kwargs)?;
    let eps = present(kwargs, "eps")
        .map(|value| number_value(OP, "eps", value))
        .transpose()?;
    Ok(Value::tensor(rms_norm(tensor, &normalized_shape, weight, eps)?))
}

fn threshold_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    const OP: &str = "nn.functional.threshold";
    let tensor = dense(OP, "input", input)?;
    let cut = number_value(OP, "threshold", required(OP, "threshold", kwargs.get("threshold"))?)?;
    let value = number_value(OP, "value", required(OP, "value", kwargs.get("value"))?)?;
    Ok(Value::tensor(threshold(tensor, cut, value)?))
}

fn non_negative(op: &'static str, name: &'static str, kwargs: &Kwargs) -> Result<u32, DispatchError> {
    let value = required(op, name, kwargs.get(name))?;
    let raw = int_value(op, name, value)?;
    u32::try_from(raw).map_err(|_| DispatchError::InvalidArgument {
        op,
        name,
        expected: "non-negative int",
        found: value.kind(),
    })
}

fn polygamma_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("polygamma", "input", input)?;
    let n = non_negative("polygamma", "n", kwargs)?;
    Ok(Value::tensor(polygamma(n, tensor)?))
}

fn mvlgamma_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("mvlgamma", "input", input)?;
    let p = non_negative("mvlgamma", "p", kwargs)?;
    Ok(Value::tensor(mvlgamma(tensor, p)?))
}

fn softmax_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("softmax", "input", input)?;
    let dim = optional_dim("softmax", kwargs)?.ok_or(DispatchError::MissingArgument {
        op: "softmax",
        name: "dim",
    })?;
    Ok(Value::tensor(softmax(tensor, dim)?))
}

fn cumsum_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("cumsum", "input", input)?;
    let dim = optional_dim("cumsum", kwargs)?.ok_or(DispatchError::MissingArgument {
        op: "cumsum",
        name: "dim",
    })?;
    Ok(Value::tensor(cumsum(tensor, dim)?))
}

fn transpose_op(input: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("transpose", "input", input)?;
    let dim0 = int_value(
        "transpose",
        "dim0",
        required("transpose", "dim0", args.first().or(kwargs.get("dim0")))?,
    )?;
    let dim1 = int_value(
        "transpose",
        "dim1",
        required("transpose", "dim1", args.get(1).or(kwargs.get("dim1")))?,
    )?;
    Ok(Value::tensor(transpose(tensor, dim0, dim1)?))
}

fn unsqueeze_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensor = dense("unsqueeze", "input", input)?;
    let dim = optional_dim("unsqueeze", kwargs)?.ok_or(DispatchError::MissingArgument {
        op: "unsqueeze",
        name: "dim",
    })?;
    Ok(Value::tensor(unsqueeze(tensor, dim)?))
}

fn cat_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensors = tensor_list("cat", "tensors", input)?;
    let dim = optional_dim("cat", kwargs)?.unwrap_or(0);
    Ok(Value::tensor(cat(&tensors, dim)?))
}

fn stack_op(input: &Value, _args: &[Value], kwargs: &Kwargs) -> Result<Value, DispatchError> {
    let tensors = tensor_list("stack", "tensors", input)?;
    let dim = optional_dim("stack", kwargs)?.unwrap_or(0);
    Ok(Value::tensor(stack(&tensors, dim)?))
}

const fn custom(name: &'static str, call: OpFn) -> OpKernel {
    OpKernel::Custom { name, call }
}

fn build_op_db() -> Vec<OpInfo> {
    use OpCategory::{BinaryElementwise, Reduction, UnaryElementwise, Unclassified};

    let mut db: Vec<OpInfo> = [
        UnaryOp::Abs,
        UnaryOp::Neg,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tanh,
        UnaryOp::Sigmoid,
        UnaryOp::Relu,
        UnaryOp::Sqrt,
        UnaryOp::Lgamma,
        UnaryOp::Digamma,
    ]
    .into_iter()
    .map(|op| OpInfo::new(op.name(), "", UnaryElementwise, OpKernel::Unary(op)))
    .collect();

    db.extend(
        [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Maximum,
            BinaryOp::Minimum,
        ]
        .into_iter()
        .map(|op| OpInfo::new(op.name(), "", BinaryElementwise, OpKernel::Binary(op))),
    );

    db.extend(
        [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Amax, ReduceOp::Amin]
            .into_iter()
            .map(|op| OpInfo::new(op.name(), "", Reduction, OpKernel::Reduce(op))),
    );

    db.extend([
        OpInfo::new("prod", "", Reduction, custom("prod", prod_op)),
        OpInfo::new("argmax", "", Reduction, custom("argmax", argmax_op)),
        OpInfo::new("argmin", "", Reduction, custom("argmin", argmin_op)),
        OpInfo::new("max", "reduction_with_dim", Reduction, custom("max", max_op)),
        OpInfo::new("min", "reduction_with_dim", Reduction, custom("min", min_op)),
        OpInfo::new("bmm", "", Unclassified, custom("bmm", bmm_op)),
        OpInfo::new("matmul", "", Unclassified, custom("matmul", matmul_op)),
        OpInfo::new("clone", "", Unclassified, custom("clone", clone_op)),
        OpInfo::new("to", "", Unclassified, custom("to", to_op)),
        OpInfo::new(
            "masked_select",
            "",
            Unclassified,
            custom("masked_select", masked_select_op),
        ),
        OpInfo::new("index_put", "", Unclassified, custom("index_put", index_put_op)),
        OpInfo::new(
            "nn.functional.embedding",
            "",
            Unclassified,
            custom("embedding", embedding_op),
        ),
        OpInfo::new(
            "nn.functional.embedding_bag",
            "",
            Unclassified,
            custom("embedding_bag", embedding_bag_op),
        ),
        OpInfo::new(
            "nn.functional.linear",
            "",
            Unclassified,
            custom("linear", linear_op),
        ),
        OpInfo::new(
            "nn.functional.rms_norm",
            "",
            Unclassified,
            custom("rms_norm", rms_norm_op),
        ),
        OpInfo::new(
            "nn.functional.threshold",
            "",
            Unclassified,
            custom("threshold", threshold_op),
        ),
    ]);

    for (variant, _) in POLYGAMMA_VARIANTS {
        db.push(OpInfo::new(
            "polygamma",
            variant,
            UnaryElementwise,
            custom("polygamma", polygamma_op),
        ));
    }
    db.push(OpInfo::new(
        "special.polygamma",
        "special_polygamma_n_0",
        UnaryElementwise,
        custom("polygamma", polygamma_op),
    ));
    for (variant, _) in MVLGAMMA_VARIANTS {
        db.push(OpInfo::new(
            "mvlgamma",
            variant,
            UnaryElementwise,
            custom("mvlgamma", mvlgamma_op),
        ));
    }

    db.extend([
        OpInfo::new("softmax", "", Unclassified, custom("softmax", softmax_op)),
        OpInfo::new("cumsum", "", Unclassified, custom("cumsum", cumsum_op)),
        OpInfo::new("transpose", "", Unclassified, custom("transpose", transpose_op)),
        OpInfo::new("unsqueeze", "", Unclassified, custom("unsqueeze", unsqueeze_op)),
        OpInfo::new("cat", "", Unclassified, custom("cat", cat_op)),
        OpInfo::new("stack", "", Unclassified, custom("stack", stack_op)),
    ]);
    db
}

/// `(variant_name, n)` for the polygamma catalog entries.
pub const POLYGAMMA_VARIANTS: [(&str, u32); 5] = [
    ("polygamma_n_0", 0),
    ("polygamma_n_1", 1),
    ("polygamma_n_2", 2),
    ("polygamma_n_3", 3),
    ("polygamma_n_4", 4),
];

/// `(variant_name, p)` for the mvlgamma catalog entries.
pub const MVLGAMMA_VARIANTS: [(&str, u32); 3] = [
    ("mvlgamma_p_1", 1),
    ("mvlgamma_p_3", 3),
    ("mvlgamma_p_5", 5),
];

/// The process-wide operation catalog, built on first use.
pub fn op_db() -> &'static [OpInfo] {
    static DB: OnceLock<Vec<OpInfo>> = OnceLock::new();
    DB.get_or_init(build_op_db)
}

#[must_use]
pub fn find_op(full_name: &str) -> Option<&'static OpInfo> {
    op_db().iter().find(|op| op.full_name() == full_name)
}
