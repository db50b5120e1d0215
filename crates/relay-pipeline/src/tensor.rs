// Conversions between candle tensors and the backend-independent HostTensor
// the coordination layer moves between ranks.

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use relay_types::pipeline::{HostTensor, TensorDtype};
use relay_types::RelayError;

use crate::error::{PipelineError, Result};

// ── Devices & dtypes ─────────────────────────────────────────────────────────

/// Parse `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
pub fn parse_device(name: &str) -> Result<Device> {
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, idx)) => {
            let idx = idx.parse::<usize>().map_err(|_| {
                RelayError::Config(format!("invalid device ordinal in `{name}`"))
            })?;
            (kind, idx)
        }
        None => (name, 0),
    };
    match kind {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(ordinal)?),
        "metal" => Ok(Device::new_metal(ordinal)?),
        other => Err(RelayError::Config(format!("unknown device `{other}`")).into()),
    }
}

pub fn candle_dtype(dtype: TensorDtype) -> DType {
    match dtype {
        TensorDtype::F16  => DType::F16,
        TensorDtype::BF16 => DType::BF16,
        TensorDtype::F32  => DType::F32,
    }
}

pub fn host_dtype(dtype: DType) -> Result<TensorDtype> {
    match dtype {
        DType::F16  => Ok(TensorDtype::F16),
        DType::BF16 => Ok(TensorDtype::BF16),
        DType::F32  => Ok(TensorDtype::F32),
        other => Err(PipelineError::Execution(format!(
            "{other:?} tensors cannot cross a stage boundary"
        ))),
    }
}

// ── Host conversion ──────────────────────────────────────────────────────────

/// Copy a tensor to host memory as little-endian bytes.
pub fn to_host(tensor: &Tensor) -> Result<HostTensor> {
    let dtype = host_dtype(tensor.dtype())?;
    let flat = tensor.flatten_all()?;
    let data: Vec<u8> = match dtype {
        TensorDtype::F32 => flat.to_vec1::<f32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorDtype::F16 => flat.to_vec1::<f16>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorDtype::BF16 => flat.to_vec1::<bf16>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
    };
    Ok(HostTensor {
        shape: tensor.dims().to_vec(),
        dtype,
        data,
    })
}

/// Rebuild a tensor on `device` from host bytes.
pub fn from_host(host: &HostTensor, device: &Device) -> Result<Tensor> {
    if !host.is_consistent() {
        return Err(PipelineError::Execution(format!(
            "host tensor {:?} {} carries {} bytes",
            host.shape,
            host.dtype,
            host.data.len()
        )));
    }
    let shape = host.shape.clone();
    let tensor = match host.dtype {
        TensorDtype::F32 => {
            let values: Vec<f32> = host
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        TensorDtype::F16 => {
            let values: Vec<f16> = host
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        TensorDtype::BF16 => {
            let values: Vec<bf16> = host
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
    };
    Ok(tensor)
}

/// Rectangular batch of token ids as a `[batch, seq]` u32 tensor.
pub fn token_ids(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let seq_len = rows.first().map_or(0, Vec::len);
    if seq_len == 0 {
        return Err(PipelineError::Execution("token batch is empty".into()));
    }
    if let Some(row) = rows.iter().position(|r| r.len() != seq_len) {
        return Err(PipelineError::Execution(format!(
            "row {row} has {} tokens, row 0 has {seq_len}",
            rows[row].len()
        )));
    }
    Ok(Tensor::from_vec(rows.concat(), (rows.len(), seq_len), device)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_host_round_trip() {
        let t = Tensor::new(&[[1.5f32, -2.0, 0.25], [3.0, 4.0, -0.5]], &Device::Cpu).unwrap();
        let host = to_host(&t).unwrap();
        assert_eq!(host.shape, vec![2, 3]);
        assert_eq!(host.dtype, TensorDtype::F32);
        assert_eq!(&host.data[..4], &1.5f32.to_le_bytes());
        assert!(host.is_consistent());

        let back = from_host(&host, &Device::Cpu).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), t.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn half_precision_survives_transfer() {
        let t = Tensor::new(&[0.5f32, 1.0, -8.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let host = to_host(&t).unwrap();
        assert_eq!(host.dtype, TensorDtype::F16);
        assert_eq!(host.data.len(), 6);
        let back = from_host(&host, &Device::Cpu).unwrap();
        assert_eq!(back.dtype(), DType::F16);
        let values = back.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.5, 1.0, -8.0]);
    }

    #[test]
    fn inconsistent_host_tensor_rejected() {
        let host = HostTensor {
            shape: vec![2, 2],
            dtype: TensorDtype::F32,
            data: vec![0; 3],
        };
        assert!(from_host(&host, &Device::Cpu).is_err());
    }

    #[test]
    fn integer_tensors_do_not_cross_stages() {
        let ids = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        assert!(matches!(to_host(&ids), Err(PipelineError::Execution(_))));
    }

    #[test]
    fn device_names() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
        assert!(parse_device("tpu:0").is_err());
        assert!(parse_device("cuda:x").is_err());
    }

    #[test]
    fn token_batches() {
        let ids = token_ids(&[vec![5, 9, 2]], &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[1, 3]);
        assert_eq!(ids.dtype(), DType::U32);
        assert!(token_ids(&[], &Device::Cpu).is_err());
        assert!(token_ids(&[vec![1, 2], vec![3]], &Device::Cpu).is_err());
    }
}
