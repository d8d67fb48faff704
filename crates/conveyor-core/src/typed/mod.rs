//! Typed - 型付き Job API
//!
//! Job type を Rust の型にすることで、キュー名の typo は黙って落ちる
//! メッセージではなくコンパイルエラーになります。
//!
//! # 二層構造
//! - **表層（Typed）**: `Job`, `StageHandler<J>` - アプリケーションコードが実装する
//! - **内部（Dyn）**: `DynHandler`, `PayloadSchema` - object-safe, `JobRegistry` に格納

pub mod codec;
pub mod handler;
pub mod job;
pub mod registry;

pub use self::codec::CodecError;
pub use self::handler::{DynHandler, PayloadSchema, StageContext, StageHandler, TypedHandler};
pub use self::job::Job;
pub use self::registry::{JobRegistry, RegistryError};
