//! 유닛 (논리적 로드 모듈)
//!
//! 하나 이상의 object 파일을 하나 이상의 이름공간에 묶은 로드 단위
//! - 파싱 (Initialize) → 링크 (Link) → 해제 (Free)
//! - 심볼 조회 및 변환
//! - 링크 계획 직렬화

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::error::{Error, Result};
use super::linker::{CodeModule, Dependency, Linker, LinkerState};
use super::symbol::{FnPtr, SharedSymbols, Sym, SymbolTable};
use super::types::TypeDescriptor;
use super::{DEFAULT_NAMESPACE, NAMESPACE_SEPARATOR, qualify};

/// 유닛 상태
///
/// 단방향 전이만 허용: Uninitialized → Initialized → Linked → Freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// 생성 직후
    Uninitialized,
    /// 파싱 완료, 심볼 검사 가능
    Initialized,
    /// 링크 완료, 심볼 사용 가능
    Linked,
    /// 해제됨 (종료 상태)
    Freed,
}

/// 로드 유닛
///
/// 내부 동기화가 없다. 초기화/링크/해제는 `&mut`가 필요하고,
/// Linked 상태에서 `&Unit`을 통한 조회와 호출은 여러 스레드에서 동시에 할 수 있다.
/// drop 시 자동으로 해제된다.
pub struct Unit {
    /// object 파일
    files: Vec<PathBuf>,
    /// 이름공간 (files와 순서 대응)
    namespaces: Vec<String>,
    /// 공유 심볼 테이블
    symbols: SharedSymbols,
    linker: Arc<dyn Linker>,
    /// 파싱된 링커 상태
    state: Option<LinkerState>,
    /// 링크된 코드 모듈
    module: Option<Box<dyn CodeModule>>,
    stage: UnitState,
}

impl Unit {
    /// 공유 심볼 테이블에 묶인 새 유닛
    pub fn new(linker: Arc<dyn Linker>, symbols: SharedSymbols) -> Self {
        Self {
            files: Vec::new(),
            namespaces: Vec::new(),
            symbols,
            linker,
            state: None,
            module: None,
            stage: UnitState::Uninitialized,
        }
    }

    /// 호스트 심볼로 시딩한 독립 테이블을 가진 유닛
    pub fn standalone(linker: Arc<dyn Linker>) -> Result<Self> {
        let mut table = SymbolTable::new();
        linker
            .register_host_symbols(&mut table)
            .map_err(Error::linker("register host symbols"))?;
        Ok(Self::new(linker, table.into_shared()))
    }

    pub fn stage(&self) -> UnitState {
        self.stage
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn symbols(&self) -> &SharedSymbols {
        &self.symbols
    }

    /// 이름공간 없는 심볼 이름에 붙는 기본 이름공간
    pub fn entry_namespace(&self) -> &str {
        self.namespaces
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    // ========================================================================
    // 초기화
    // ========================================================================

    /// object 파일 하나로 초기화
    pub fn initialize(
        &mut self,
        file: impl AsRef<Path>,
        namespace: &str,
        types: &[TypeDescriptor],
    ) -> Result<()> {
        self.initialize_many(&[file.as_ref()], &[namespace], types)
    }

    /// 여러 object 파일로 초기화 (files[i]는 namespaces[i]에 속함)
    pub fn initialize_many<P, S>(&mut self, files: &[P], namespaces: &[S], types: &[TypeDescriptor]) -> Result<()>
    where
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        self.ensure_fresh()?;
        if files.len() != namespaces.len() {
            return Err(Error::MismatchedInputs {
                files: files.len(),
                namespaces: namespaces.len(),
            });
        }
        let files: Vec<PathBuf> = files.iter().map(|f| f.as_ref().to_path_buf()).collect();
        let namespaces: Vec<String> = namespaces.iter().map(|n| n.as_ref().to_owned()).collect();

        self.register_types(types);
        let state = self
            .linker
            .parse(&files, &namespaces)
            .map_err(Error::linker("parse object files"))?;

        debug!("[unit] parsed {:?} into {:?}", files, namespaces);
        self.files = files;
        self.namespaces = namespaces;
        self.state = Some(state);
        self.stage = UnitState::Initialized;
        Ok(())
    }

    /// 직렬화된 링크 계획으로 초기화 (원시 파싱 생략)
    pub fn initialize_serialized(&mut self, input: &mut dyn Read, types: &[TypeDescriptor]) -> Result<()> {
        self.ensure_fresh()?;
        self.register_types(types);
        let state = self
            .linker
            .parse_serialized(input)
            .map_err(Error::linker("read serialized link plan"))?;

        self.namespaces = self.linker.plan_namespaces(&state);
        debug!("[unit] restored link plan for {:?}", self.namespaces);
        self.state = Some(state);
        self.stage = UnitState::Initialized;
        Ok(())
    }

    fn ensure_fresh(&self) -> Result<()> {
        match self.stage {
            UnitState::Uninitialized => Ok(()),
            UnitState::Freed => Err(Error::Freed),
            UnitState::Initialized | UnitState::Linked => Err(Error::AlreadyInitialized),
        }
    }

    fn register_types(&self, types: &[TypeDescriptor]) {
        if types.is_empty() {
            return;
        }
        debug!(
            "[unit] register types {:?}",
            types.iter().map(|t| t.name).collect::<Vec<_>>()
        );
        self.linker
            .register_type_descriptors(&mut self.symbols.write(), types);
    }

    // ========================================================================
    // 링크
    // ========================================================================

    /// 링크 전에 의존성 패키지 공급
    pub fn load_dependencies(&mut self, dependencies: &[Dependency]) -> Result<()> {
        match self.stage {
            UnitState::Initialized => {}
            UnitState::Uninitialized => return Err(Error::Uninitialized),
            UnitState::Linked => return Err(Error::Linked),
            UnitState::Freed => return Err(Error::Freed),
        }
        let state = self.state.as_mut().ok_or(Error::Uninitialized)?;
        let table = self.symbols.read();
        for dependency in dependencies {
            self.linker
                .resolve_dependency(state, dependency, &table)
                .map_err(Error::linker("resolve dependency"))?;
            debug!(
                "[unit] dependency {} resolved ({} symbols)",
                dependency.namespace,
                dependency.symbols.len()
            );
        }
        Ok(())
    }

    /// 링크 및 코드 모듈 생성
    ///
    /// 실패하면 Initialized 상태로 남아 의존성을 보충한 뒤 다시 시도할 수 있다.
    pub fn link(&mut self) -> Result<()> {
        match self.stage {
            UnitState::Initialized => {}
            UnitState::Uninitialized => return Err(Error::Uninitialized),
            UnitState::Linked => return Err(Error::Linked),
            UnitState::Freed => return Err(Error::Freed),
        }
        let state = self.state.as_ref().ok_or(Error::Uninitialized)?;
        let module = {
            let table = self.symbols.read();
            self.linker.load(state, &table).map_err(Error::linker("link"))?
        };

        info!(
            "[unit] {:?} linked, {} symbols defined",
            self.namespaces,
            module.symbols().len()
        );
        self.module = Some(module);
        self.stage = UnitState::Linked;
        Ok(())
    }

    // ========================================================================
    // 심볼
    // ========================================================================

    fn normalize<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if name.contains(NAMESPACE_SEPARATOR) {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(qualify(self.entry_namespace(), name))
        }
    }

    /// 심볼 조회. 링크 전에는 항상 None
    pub fn fetch(&self, name: &str) -> Option<Sym> {
        let module = self.module.as_ref()?;
        let name = self.normalize(name);
        let address = *module.symbols().get(&*name)?;
        debug!("[unit] found symbol {} at 0x{:x}", name, address);
        Some(Sym::from_addr(address))
    }

    /// 심볼 조회 (없으면 에러)
    pub fn must_fetch(&self, name: &str) -> Result<Sym> {
        if self.module.is_none() {
            return Err(Error::Uninitialized);
        }
        self.fetch(name)
            .ok_or_else(|| Error::MissingSymbol(self.normalize(name).into_owned()))
    }

    /// 심볼을 조회해 단일 사용 변환 후 `args`로 호출
    ///
    /// 모듈 코드의 panic은 [`Error::Panicked`]로 돌려준다.
    ///
    /// # Safety
    ///
    /// `F`는 심볼의 실제 시그니처와 일치하는 함수 포인터 타입이어야 한다.
    pub unsafe fn invoke<F: FnPtr>(&self, name: &str, args: F::Args) -> Result<F::Output> {
        let sym = self.must_fetch(name)?;
        let once = unsafe { sym.cast_once::<F>() };
        panic::catch_unwind(AssertUnwindSafe(move || once.call(args)))
            .map_err(|payload| Error::Panicked(panic_message(&*payload)))
    }

    /// 공유 테이블에 있는 심볼 이름 (링크 전 의존성 확인용)
    pub fn exists_symbols(&self) -> Vec<String> {
        self.symbols.read().names()
    }

    /// 참조되었지만 현재 테이블로 해석되지 않는 심볼
    pub fn missing_symbols(&self) -> Result<Vec<String>> {
        let state = self.parsed_state()?;
        let mut missing = self.linker.unresolved_symbols(state, &self.symbols.read());
        missing.sort_unstable();
        Ok(missing)
    }

    /// 코드 모듈이 정의한 심볼 이름. 링크 전에는 비어 있음
    pub fn exports(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .module
            .as_ref()
            .map(|m| m.symbols().keys().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    fn parsed_state(&self) -> Result<&LinkerState> {
        if self.stage == UnitState::Freed {
            return Err(Error::Freed);
        }
        self.state.as_ref().ok_or(Error::Uninitialized)
    }

    pub(crate) fn module_symbols(&self) -> Option<&HashMap<String, usize>> {
        self.module.as_ref().map(|m| m.symbols())
    }

    /// 링크 계획 직렬화 (로드된 코드가 아님)
    pub fn serialize(&self, output: &mut dyn Write) -> Result<()> {
        let state = self.parsed_state()?;
        self.linker
            .serialize_state(state, output)
            .map_err(Error::linker("serialize link plan"))
    }

    // ========================================================================
    // 해제
    // ========================================================================

    /// 코드 모듈 매핑 해제 및 내부 상태 폐기 (멱등)
    ///
    /// `flush`가 참이면 매핑 해제 전에 표준 출력을 비운다.
    /// 모듈 코드가 쓴 버퍼가 해제된 메모리를 가리키지 않도록 하기 위함.
    pub fn free(&mut self, flush: bool) {
        if self.stage == UnitState::Freed {
            return;
        }
        if let Some(module) = self.module.take() {
            if flush {
                let _ = io::stdout().flush();
                let _ = io::stderr().flush();
            }
            self.linker.unload(module);
            info!("[unit] {:?} unloaded", self.namespaces);
        }
        self.state = None;
        self.files.clear();
        self.namespaces.clear();
        self.stage = UnitState::Freed;
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.free(false);
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("files", &self.files)
            .field("namespaces", &self.namespaces)
            .field("stage", &self.stage)
            .field("exports", &self.module_symbols().map_or(0, HashMap::len))
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
