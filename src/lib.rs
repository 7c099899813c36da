//! hotmod
//!
//! 실행 중인 프로세스에 relocatable 코드 유닛을 로드/링크하고,
//! 재시작 없이 언로드하거나 교체(hot-swap)하는 모듈 레지스트리.
//!
//! - 공유 심볼 테이블 (first-definer-wins 병합, exact-match 해제)
//! - 유닛 라이프사이클 (Uninitialized → Initialized → Linked → Freed)
//! - 로드 순서 기반 안전한 reload/unload
//! - 프로세스 전역 레지스트리
//!
//! 실제 파싱/재배치/메모리 매핑은 [`module::Linker`] 구현체가 담당한다.

pub mod config;
pub mod module;

#[cfg(test)]
mod test_linker;

pub use config::RegistryConfig;
pub use module::{
    BoxError, CodeModule, Dependency, Error, FnPtr, GlobalRegistry, Linker, LinkerState, OnceFn, Registry,
    Result, SharedSymbols, Sym, SymbolTable, TypeDescriptor, TypeRegistry, Unit, UnitState,
};
