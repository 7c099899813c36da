//! 모듈 에러

use std::io;

use thiserror::Error;

use super::linker::BoxError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 모듈 시스템 에러
#[derive(Debug, Error)]
pub enum Error {
    /// 이미 파싱된 상태가 있는 유닛을 다시 초기화
    #[error("unit already initialized")]
    AlreadyInitialized,
    /// 이름공간이 이미 레지스트리에 로드됨
    #[error("namespace '{0}' already loaded")]
    AlreadyLoaded(String),
    /// 초기화(또는 링크) 전 유닛 사용
    #[error("unit not initialized")]
    Uninitialized,
    /// 이미 링크됨 (링크 전 상태가 필요한 작업 포함)
    #[error("unit already linked")]
    Linked,
    /// 해제된 유닛 재사용
    #[error("unit already freed")]
    Freed,
    /// 심볼을 찾을 수 없음
    #[error("missing symbol '{0}'")]
    MissingSymbol(String),
    /// 이름공간이 로드되지 않음 (조회)
    #[error("package '{0}' not loaded")]
    MissingPackage(String),
    /// 이름공간이 로드되지 않음 (reload/unload)
    #[error("namespace '{0}' not loaded")]
    NotLoaded(String),
    /// 로드 순서 기록 손상 (내부 불변식 위반)
    #[error("registry bookkeeping corrupted: {0}")]
    Corrupted(String),
    /// 전역 레지스트리에 같은 이름이 이미 존재
    #[error("'{0}' already registered into global")]
    AlreadyExists(String),
    /// 전역 레지스트리에 등록되지 않은 이름
    #[error("'{0}' not registered into global")]
    NotExists(String),
    /// 파일과 이름공간 개수 불일치
    #[error("{files} object files but {namespaces} namespaces")]
    MismatchedInputs { files: usize, namespaces: usize },
    /// 직렬화된 링크 계획에 이름공간이 없음
    #[error("serialized link plan declares no namespace")]
    EmptyLinkPlan,
    /// 모듈 코드 실행 중 panic
    #[error("symbol invocation panicked: {0}")]
    Panicked(String),
    /// 링커 협력자 실패
    #[error("linker failed to {stage}")]
    Linker {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn linker(stage: &'static str) -> impl FnOnce(BoxError) -> Self {
        move |source| Error::Linker { stage, source }
    }
}
