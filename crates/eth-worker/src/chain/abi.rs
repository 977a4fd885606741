//! Contract ABI registry.
//!
//! Maps an ABI kind (for calls) or a contract name (for deployments) to its
//! JSON ABI, and encodes JSON arguments into calldata. Positional `args` come
//! first; remaining parameters are taken from `kwargs` by parameter name.
//!
//! Contract files are read from a directory. Either of these layouts works:
//!
//! - `<name>.abi.json` holding the ABI array, plus `<name>.bin` holding the
//!   hex creation bytecode;
//! - `<name>.json` holding a build artifact `{"abi": [...], "bytecode": ...}`.

use crate::error::{WorkerError, WorkerResult};
use alloy::dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier};
use alloy::json_abi::{Function, JsonAbi, Param};
use alloy::primitives::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// ABI kind of the bundled ERC20 interface.
pub const ERC20: &str = "ERC20";

const ERC20_ABI: &str = r#"[
  {"type":"function","name":"name","stateMutability":"view","inputs":[],"outputs":[{"name":"","type":"string"}]},
  {"type":"function","name":"symbol","stateMutability":"view","inputs":[],"outputs":[{"name":"","type":"string"}]},
  {"type":"function","name":"decimals","stateMutability":"view","inputs":[],"outputs":[{"name":"","type":"uint8"}]},
  {"type":"function","name":"totalSupply","stateMutability":"view","inputs":[],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"balanceOf","stateMutability":"view","inputs":[{"name":"account","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"allowance","stateMutability":"view","inputs":[{"name":"owner","type":"address"},{"name":"spender","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"transfer","stateMutability":"nonpayable","inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}]},
  {"type":"function","name":"approve","stateMutability":"nonpayable","inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}]},
  {"type":"function","name":"transferFrom","stateMutability":"nonpayable","inputs":[{"name":"from","type":"address"},{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}]},
  {"type":"event","name":"Transfer","anonymous":false,"inputs":[{"name":"from","type":"address","indexed":true},{"name":"to","type":"address","indexed":true},{"name":"value","type":"uint256","indexed":false}]},
  {"type":"event","name":"Approval","anonymous":false,"inputs":[{"name":"owner","type":"address","indexed":true},{"name":"spender","type":"address","indexed":true},{"name":"value","type":"uint256","indexed":false}]}
]"#;

#[derive(Debug, Clone)]
struct Contract {
    abi: JsonAbi,
    bytecode: Option<Bytes>,
}

/// Known ABIs and deployable contracts.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, Contract>,
}

/// A function call with its arguments already encoded.
#[derive(Debug, Clone)]
pub struct EncodedCall<'a> {
    pub function: &'a Function,
    pub calldata: Bytes,
}

impl EncodedCall<'_> {
    /// Decodes the return data of this call into JSON values.
    pub fn decode_output(&self, data: &[u8]) -> WorkerResult<Vec<Value>> {
        let values = self.function.abi_decode_output(data).map_err(|e| {
            WorkerError::abi(format!("cannot decode output of {}: {e}", self.function.name))
        })?;
        Ok(values.into_iter().map(to_json).collect())
    }
}

impl ContractRegistry {
    /// A registry holding the bundled ERC20 interface.
    pub fn with_builtins() -> WorkerResult<Self> {
        let mut registry = Self::default();
        registry.register(ERC20, serde_json::from_str(ERC20_ABI)?, None);
        Ok(registry)
    }

    /// Adds a contract. Replaces any earlier entry under the same name.
    pub fn register(&mut self, name: &str, abi: JsonAbi, bytecode: Option<Bytes>) {
        self.contracts
            .insert(name.to_string(), Contract { abi, bytecode });
    }

    /// Loads every contract file in `dir`.
    pub fn load_dir(mut self, dir: &Path) -> WorkerResult<Self> {
        let mut loaded = 0usize;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(name) = file_name.strip_suffix(".abi.json") {
                let abi: JsonAbi = serde_json::from_slice(&fs::read(&path)?)?;
                let bin = path.with_file_name(format!("{name}.bin"));
                let bytecode = if bin.exists() {
                    Some(parse_bytecode(&fs::read_to_string(&bin)?)?)
                } else {
                    None
                };
                self.register(name, abi, bytecode);
                loaded += 1;
            } else if let Some(name) = file_name.strip_suffix(".json") {
                let artifact: Value = serde_json::from_slice(&fs::read(&path)?)?;
                let Some(abi) = artifact.get("abi") else {
                    debug!(path = %path.display(), "Skipping json file without an abi");
                    continue;
                };
                let abi: JsonAbi = serde_json::from_value(abi.clone())?;
                let bytecode = match artifact.get("bytecode") {
                    Some(Value::String(hex)) => Some(parse_bytecode(hex)?),
                    Some(Value::Object(obj)) => match obj.get("object") {
                        Some(Value::String(hex)) => Some(parse_bytecode(hex)?),
                        _ => None,
                    },
                    _ => None,
                };
                self.register(name, abi, bytecode);
                loaded += 1;
            }
        }
        info!(dir = %dir.display(), contracts = loaded, "Loaded contract files");
        Ok(self)
    }

    fn contract(&self, name: &str) -> WorkerResult<&Contract> {
        self.contracts
            .get(name)
            .ok_or_else(|| WorkerError::abi(format!("unknown contract or abi kind '{name}'")))
    }

    /// Encodes a call to `function` of `abi_kind`.
    ///
    /// Overloads are told apart by argument count, then by whether the
    /// arguments coerce to the parameter types.
    pub fn encode_function_call(
        &self,
        abi_kind: &str,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> WorkerResult<EncodedCall<'_>> {
        let contract = self.contract(abi_kind)?;
        let overloads = contract
            .abi
            .function(function)
            .ok_or_else(|| WorkerError::abi(format!("{abi_kind} has no function '{function}'")))?;

        let arity = args.len() + kwargs.len();
        let mut last_error = None;
        for candidate in overloads.iter().filter(|f| f.inputs.len() == arity) {
            match resolve_arguments(&candidate.inputs, args, kwargs) {
                Ok(values) => {
                    let calldata = candidate
                        .abi_encode_input(&values)
                        .map_err(|e| WorkerError::abi(e.to_string()))?;
                    return Ok(EncodedCall {
                        function: candidate,
                        calldata: calldata.into(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            WorkerError::abi(format!(
                "{abi_kind}.{function} does not take {arity} arguments"
            ))
        }))
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn encode_deployment(
        &self,
        contract_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> WorkerResult<Bytes> {
        let contract = self.contract(contract_name)?;
        let bytecode = contract
            .bytecode
            .as_ref()
            .ok_or_else(|| WorkerError::abi(format!("no bytecode for contract '{contract_name}'")))?;

        let mut data = bytecode.to_vec();
        match &contract.abi.constructor {
            Some(constructor) => {
                let values = resolve_arguments(&constructor.inputs, args, kwargs)?;
                let encoded = constructor
                    .abi_encode_input(&values)
                    .map_err(|e| WorkerError::abi(e.to_string()))?;
                data.extend_from_slice(&encoded);
            }
            None if args.is_empty() && kwargs.is_empty() => {}
            None => {
                return Err(WorkerError::abi(format!(
                    "contract '{contract_name}' has no constructor but arguments were given"
                )))
            }
        }
        Ok(data.into())
    }
}

fn parse_bytecode(hex_str: &str) -> WorkerResult<Bytes> {
    let trimmed = hex_str.trim();
    Ok(hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))?.into())
}

fn resolve_arguments(
    inputs: &[Param],
    args: &[Value],
    kwargs: &Map<String, Value>,
) -> WorkerResult<Vec<DynSolValue>> {
    if args.len() > inputs.len() {
        return Err(WorkerError::abi(format!(
            "expected at most {} positional arguments, got {}",
            inputs.len(),
            args.len()
        )));
    }
    inputs
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let value = match args.get(i) {
                Some(value) => value,
                None => kwargs.get(&param.name).ok_or_else(|| {
                    WorkerError::abi(format!("missing argument '{}'", param.name))
                })?,
            };
            let ty = param
                .resolve()
                .map_err(|e| WorkerError::abi(format!("bad type for '{}': {e}", param.name)))?;
            coerce(&ty, value)
                .map_err(|e| WorkerError::abi(format!("argument '{}': {e}", param.name)))
        })
        .collect()
}

/// Converts a JSON value into a Solidity value of type `ty`.
fn coerce(ty: &DynSolType, value: &Value) -> WorkerResult<DynSolValue> {
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items)) => Ok(DynSolValue::Array(
            items
                .iter()
                .map(|item| coerce(inner, item))
                .collect::<WorkerResult<_>>()?,
        )),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) if items.len() == *len => {
            Ok(DynSolValue::FixedArray(
                items
                    .iter()
                    .map(|item| coerce(inner, item))
                    .collect::<WorkerResult<_>>()?,
            ))
        }
        (DynSolType::Tuple(types), Value::Array(items)) if items.len() == types.len() => {
            Ok(DynSolValue::Tuple(
                types
                    .iter()
                    .zip(items)
                    .map(|(ty, item)| coerce(ty, item))
                    .collect::<WorkerResult<_>>()?,
            ))
        }
        (_, Value::String(s)) => coerce_str(ty, s),
        (_, Value::Number(n)) => coerce_str(ty, &n.to_string()),
        (_, Value::Bool(b)) => coerce_str(ty, if *b { "true" } else { "false" }),
        _ => Err(WorkerError::abi(format!("cannot use {value} as {ty}"))),
    }
}

fn coerce_str(ty: &DynSolType, s: &str) -> WorkerResult<DynSolValue> {
    ty.coerce_str(s)
        .map_err(|e| WorkerError::abi(format!("cannot use '{s}' as {ty}: {e}")))
}

/// Integers are rendered as decimal strings so no precision is lost.
fn to_json(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..size])))
        }
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.into_iter().map(to_json).collect())
        }
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use serde_json::json;

    #[test]
    fn test_encode_transfer_from_positional_and_kwargs() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);

        let positional = registry
            .encode_function_call(
                ERC20,
                "transferFrom",
                &[json!(from.to_string()), json!(to.to_string()), json!(1000)],
                &Map::new(),
            )
            .unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("to".to_string(), json!(to.to_string()));
        kwargs.insert("amount".to_string(), json!("1000"));
        let mixed = registry
            .encode_function_call(ERC20, "transferFrom", &[json!(from.to_string())], &kwargs)
            .unwrap();

        assert_eq!(positional.calldata, mixed.calldata);
        // transferFrom(address,address,uint256)
        assert_eq!(&positional.calldata[..4], &[0x23, 0xb8, 0x72, 0xdd]);
        assert_eq!(positional.calldata.len(), 4 + 32 * 3);
        assert_eq!(
            U256::from_be_slice(&positional.calldata[68..100]),
            U256::from(1000u64)
        );
    }

    #[test]
    fn test_encode_errors() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let none = Map::new();
        assert!(registry
            .encode_function_call("Unknown", "transfer", &[], &none)
            .is_err());
        assert!(registry
            .encode_function_call(ERC20, "mint", &[], &none)
            .is_err());
        assert!(registry
            .encode_function_call(ERC20, "transfer", &[json!("0x01")], &none)
            .is_err());
        assert!(registry
            .encode_function_call(ERC20, "transfer", &[json!("not an address"), json!(1)], &none)
            .is_err());
    }

    #[test]
    fn test_decode_output() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let call = registry
            .encode_function_call(ERC20, "balanceOf", &[json!(Address::ZERO.to_string())], &Map::new())
            .unwrap();
        let output = U256::from(42u64).to_be_bytes::<32>();
        assert_eq!(call.decode_output(&output).unwrap(), vec![json!("42")]);
    }

    #[test]
    fn test_load_dir_and_encode_deployment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("Greeter.abi.json"),
            r#"[{"type":"constructor","stateMutability":"nonpayable","inputs":[{"name":"greeting","type":"string"},{"name":"owners","type":"address[]"}]}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("Greeter.bin"), "0x6080\n").unwrap();
        fs::write(
            dir.path().join("Token.json"),
            r#"{"abi":[],"bytecode":{"object":"0xfe"}}"#,
        )
        .unwrap();

        let registry = ContractRegistry::with_builtins()
            .unwrap()
            .load_dir(dir.path())
            .unwrap();

        let data = registry
            .encode_deployment(
                "Greeter",
                &[json!("hi"), json!([Address::repeat_byte(3).to_string()])],
                &Map::new(),
            )
            .unwrap();
        assert_eq!(&data[..2], &[0x60, 0x80]);
        assert!(data.len() > 2);

        assert_eq!(
            registry.encode_deployment("Token", &[], &Map::new()).unwrap(),
            Bytes::from(vec![0xfe])
        );
        assert!(registry
            .encode_deployment("Token", &[json!(1)], &Map::new())
            .is_err());
        assert!(registry.encode_deployment(ERC20, &[], &Map::new()).is_err());
    }
}
