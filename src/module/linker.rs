//! 링커/로더 협력자 인터페이스
//!
//! object 파일 파싱, 재배치, 실행 메모리 매핑/해제, 링크 계획 직렬화는
//! 이 크레이트 밖의 구현체가 담당한다. 유닛과 레지스트리는 아래 기본 연산만 호출한다.

use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::symbol::SymbolTable;
use super::types::TypeDescriptor;

/// 협력자가 돌려주는 에러
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 파싱된 링커 상태 (주소 할당 전 중간 표현)
///
/// 내용은 협력자만 해석한다. 구현체는 `downcast_ref`로 자기 타입을 꺼낸다.
pub type LinkerState = Box<dyn Any + Send + Sync>;

/// 링크 결과물: 실행 가능한 상태로 매핑된 코드 모듈
pub trait CodeModule: Any + Send + Sync {
    /// 모듈이 정의한 정규화된 이름 → 주소
    fn symbols(&self) -> &HashMap<String, usize>;

    /// 매핑 해제 시 협력자가 구체 타입을 되찾기 위한 변환
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

/// 별도 최상위 유닛이 되지 않는 의존성 패키지
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// 컴파일된 의존성 파일
    pub file: PathBuf,
    /// 의존성 이름공간
    pub namespace: String,
    /// 해석에 사용할 심볼 목록
    pub symbols: Vec<String>,
}

impl Dependency {
    pub fn new(file: impl Into<PathBuf>, namespace: &str, symbols: &[&str]) -> Self {
        Self {
            file: file.into(),
            namespace: namespace.to_owned(),
            symbols: symbols.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// 링커/로더 협력자
///
/// 모든 호출은 원자적인 동기 작업으로 취급하며 재시도하지 않는다.
pub trait Linker: Send + Sync {
    /// object 파일들을 이름공간과 짝지어 파싱
    fn parse(&self, files: &[PathBuf], namespaces: &[String]) -> Result<LinkerState, BoxError>;

    /// 직렬화된 링크 계획에서 상태 복원
    fn parse_serialized(&self, input: &mut dyn Read) -> Result<LinkerState, BoxError>;

    /// 상태가 선언하는 이름공간 목록
    fn plan_namespaces(&self, state: &LinkerState) -> Vec<String>;

    /// 의존성 파일을 읽어 교차 이름공간 참조 해석에 사용
    fn resolve_dependency(
        &self,
        state: &mut LinkerState,
        dependency: &Dependency,
        table: &SymbolTable,
    ) -> Result<(), BoxError>;

    /// 주소 할당 및 실행 메모리 매핑
    fn load(&self, state: &LinkerState, table: &SymbolTable) -> Result<Box<dyn CodeModule>, BoxError>;

    /// 테이블로 해석되지 않는 참조 이름
    fn unresolved_symbols(&self, state: &LinkerState, table: &SymbolTable) -> Vec<String>;

    /// 링크 계획 직렬화
    fn serialize_state(&self, state: &LinkerState, output: &mut dyn Write) -> Result<(), BoxError>;

    /// 코드 모듈 매핑 해제 (실패하지 않는다)
    fn unload(&self, module: Box<dyn CodeModule>);

    /// 호스트 프로세스 자신의 심볼 등록
    fn register_host_symbols(&self, table: &mut SymbolTable) -> Result<(), BoxError>;

    /// 외부 동적 라이브러리의 심볼 등록
    fn register_library_symbols(&self, table: &mut SymbolTable, path: &Path) -> Result<(), BoxError>;

    /// 외부 실행 파일의 심볼 등록 (의존성 확인용, 링크 대상 아님)
    fn register_executable_symbols(&self, table: &mut SymbolTable, path: &Path) -> Result<(), BoxError>;

    /// 타입 디스크립터 등록
    fn register_type_descriptors(&self, table: &mut SymbolTable, descriptors: &[TypeDescriptor]) {
        table.types_mut().register_all(descriptors);
    }
}
