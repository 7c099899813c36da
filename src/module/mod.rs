//! 모듈 시스템
//!
//! relocatable object 유닛 관리
//! - 공유 심볼 테이블 및 심볼 핸들
//! - 타입 디스크립터 레지스트리
//! - 유닛 라이프사이클
//! - 레지스트리 (로드 순서 / reload 안전성)
//! - 전역 레지스트리

pub mod error;
pub mod global;
pub mod linker;
pub mod registry;
pub mod symbol;
pub mod types;
pub mod unit;

pub use error::{Error, Result};
pub use global::GlobalRegistry;
pub use linker::{BoxError, CodeModule, Dependency, Linker, LinkerState};
pub use registry::Registry;
pub use symbol::{FnPtr, OnceFn, SharedSymbols, Sym, SymbolTable};
pub use types::{TypeDescriptor, TypeRegistry};
pub use unit::{Unit, UnitState};

/// 이름공간이 지정되지 않았을 때 사용하는 기본 이름공간
pub const DEFAULT_NAMESPACE: &str = "main";

/// 이름공간과 심볼 이름 구분자
pub const NAMESPACE_SEPARATOR: char = '.';

/// `namespace.symbol` 형태의 정규화된 이름 생성
pub fn qualify(namespace: &str, symbol: &str) -> String {
    let mut name = String::with_capacity(namespace.len() + symbol.len() + 1);
    name.push_str(namespace);
    name.push(NAMESPACE_SEPARATOR);
    name.push_str(symbol);
    name
}
