//! Feast wire types shared by every backend.
//!
//! Field tags match `feast/types/Value.proto` and `feast/types/EntityKey.proto`, so values
//! written here can be read by other Feast online-store clients.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(oneof = "value::Val", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub val: ::core::option::Option<value::Val>,
}

pub mod value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Val {
        #[prost(bytes = "vec", tag = "1")]
        BytesVal(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        StringVal(::prost::alloc::string::String),
        #[prost(int32, tag = "3")]
        Int32Val(i32),
        #[prost(int64, tag = "4")]
        Int64Val(i64),
        #[prost(double, tag = "5")]
        DoubleVal(f64),
        #[prost(float, tag = "6")]
        FloatVal(f32),
        #[prost(bool, tag = "7")]
        BoolVal(bool),
        #[prost(int64, tag = "8")]
        UnixTimestampVal(i64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntityKey {
    #[prost(string, repeated, tag = "1")]
    pub join_keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "2")]
    pub entity_values: ::prost::alloc::vec::Vec<Value>,
}

/// Value type discriminants from `feast/types/Value.proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ValueType {
    Bytes = 1,
    String = 2,
    Int32 = 3,
    Int64 = 4,
    Double = 5,
    Float = 6,
    Bool = 7,
    UnixTimestamp = 8,
}

impl Value {
    pub fn null() -> Self {
        Self { val: None }
    }

    /// Type of the carried value, `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        use value::Val;
        self.val.as_ref().map(|val| match val {
            Val::BytesVal(_) => ValueType::Bytes,
            Val::StringVal(_) => ValueType::String,
            Val::Int32Val(_) => ValueType::Int32,
            Val::Int64Val(_) => ValueType::Int64,
            Val::DoubleVal(_) => ValueType::Double,
            Val::FloatVal(_) => ValueType::Float,
            Val::BoolVal(_) => ValueType::Bool,
            Val::UnixTimestampVal(_) => ValueType::UnixTimestamp,
        })
    }
}

impl From<value::Val> for Value {
    fn from(val: value::Val) -> Self {
        Self { val: Some(val) }
    }
}

impl EntityKey {
    pub fn new<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        let (join_keys, entity_values) = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .unzip();
        Self {
            join_keys,
            entity_values,
        }
    }
}
