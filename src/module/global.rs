//! 전역 레지스트리
//!
//! 프로세스 전체에서 공유하는 유닛 저장소. 키는 호출자가 정한다.
//! 로드 순서를 기록하지 않으므로 유닛 간 의존성이 있으면
//! 해제 순서를 호출자가 직접 관리해야 한다.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::linker::Linker;
use super::symbol::{SharedSymbols, SymbolTable};
use super::types::TypeDescriptor;
use super::unit::Unit;
use crate::config::RegistryConfig;

static GLOBAL: OnceLock<GlobalRegistry> = OnceLock::new();

/// 전역 레지스트리 초기화 (최초 한 번만 생성, 이후 호출은 기존 인스턴스 반환)
///
/// 설정은 환경 변수에서 읽는다.
pub fn init(linker: Arc<dyn Linker>) -> Result<&'static GlobalRegistry> {
    if let Some(global) = GLOBAL.get() {
        return Ok(global);
    }
    let registry = GlobalRegistry::with_config(linker, RegistryConfig::from_env())?;
    Ok(GLOBAL.get_or_init(|| registry))
}

/// 초기화된 전역 레지스트리
pub fn get() -> Option<&'static GlobalRegistry> {
    GLOBAL.get()
}

/// 이름으로 유닛을 관리하는 레지스트리
pub struct GlobalRegistry {
    linker: Arc<dyn Linker>,
    symbols: SharedSymbols,
    config: RegistryConfig,
    modules: RwLock<HashMap<String, Unit>>,
}

impl GlobalRegistry {
    /// 호스트 심볼로 시딩한 새 인스턴스
    pub fn new(linker: Arc<dyn Linker>) -> Result<Self> {
        Self::with_config(linker, RegistryConfig::default())
    }

    pub fn with_config(linker: Arc<dyn Linker>, config: RegistryConfig) -> Result<Self> {
        let table = host_table(linker.as_ref())?;
        Ok(Self {
            linker,
            symbols: table.into_shared(),
            config,
            modules: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ========================================================================
    // 시딩
    // ========================================================================

    pub fn use_library(&self, path: impl AsRef<Path>) -> Result<()> {
        self.linker
            .register_library_symbols(&mut self.symbols.write(), path.as_ref())
            .map_err(Error::linker("register library symbols"))
    }

    pub fn use_executable(&self, path: impl AsRef<Path>) -> Result<()> {
        self.linker
            .register_executable_symbols(&mut self.symbols.write(), path.as_ref())
            .map_err(Error::linker("register executable symbols"))
    }

    pub fn use_types(&self, types: &[TypeDescriptor]) {
        self.linker
            .register_type_descriptors(&mut self.symbols.write(), types);
    }

    // ========================================================================
    // 로드
    // ========================================================================

    /// object 파일 로드 (파일 경로가 키)
    pub fn load_object(&self, file: impl AsRef<Path>, namespace: &str) -> Result<()> {
        let file = file.as_ref();
        self.load(&file.display().to_string(), file, namespace)
    }

    /// 링크 계획 파일 로드 (파일 경로가 키, 읽기 전용으로 연다)
    pub fn load_linkable_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut input = File::open(path)?;
        self.load_linkable(&path.display().to_string(), &mut input)
    }

    /// object 파일을 `name` 키로 로드
    pub fn load(&self, name: &str, file: impl AsRef<Path>, namespace: &str) -> Result<()> {
        let namespace = self.config.namespace_or_default(namespace);
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            warn!("[global] '{}' already registered", name);
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let mut unit = self.unit();
        unit.initialize(file, namespace, &[])?;
        unit.link()?;
        self.admit(&mut modules, name, unit);
        Ok(())
    }

    /// 직렬화된 링크 계획을 `name` 키로 로드
    pub fn load_linkable(&self, name: &str, input: &mut dyn Read) -> Result<()> {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            warn!("[global] '{}' already registered", name);
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let mut unit = self.unit();
        unit.initialize_serialized(input, &[])?;
        if unit.namespaces().is_empty() {
            return Err(Error::EmptyLinkPlan);
        }
        unit.link()?;
        self.admit(&mut modules, name, unit);
        Ok(())
    }

    fn admit(&self, modules: &mut HashMap<String, Unit>, name: &str, unit: Unit) {
        if let Some(exports) = unit.module_symbols() {
            let added = self.symbols.write().merge(exports);
            debug!("[global] merged {} of {} symbols from '{}'", added, exports.len(), name);
        }
        info!("[global] '{}' loaded {:?}", name, unit.namespaces());
        modules.insert(name.to_owned(), unit);
    }

    fn release(&self, name: &str, unit: &Unit) {
        if let Some(exports) = unit.module_symbols() {
            let removed = self.symbols.write().unmerge(exports);
            debug!("[global] unmerged {} symbols of '{}'", removed, name);
        }
    }

    /// 유닛 해제
    pub fn unload(&self, name: &str) -> Result<()> {
        let mut unit = self
            .modules
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotExists(name.to_owned()))?;
        self.release(name, &unit);
        unit.free(self.config.flush_on_free);
        warn!("[global] '{}' unloaded", name);
        Ok(())
    }

    // ========================================================================
    // 외부 유닛 등록
    // ========================================================================

    /// 호출자가 만든 유닛의 소유권을 넘겨받아 등록
    ///
    /// 같은 이름이 이미 있으면 넘겨받은 유닛은 drop되어 해제된다.
    pub fn register(&self, name: &str, unit: Unit) -> Result<()> {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            warn!("[global] '{}' already registered", name);
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        self.admit(&mut modules, name, unit);
        Ok(())
    }

    /// 등록 해제 후 유닛 소유권 반환 (해제하지 않는다)
    pub fn unregister(&self, name: &str) -> Result<Unit> {
        let unit = self
            .modules
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotExists(name.to_owned()))?;
        self.release(name, &unit);
        Ok(unit)
    }

    // ========================================================================
    // 조회
    // ========================================================================

    /// 전역 테이블에 묶인 새 유닛
    pub fn unit(&self) -> Unit {
        Unit::new(Arc::clone(&self.linker), Arc::clone(&self.symbols))
    }

    /// 전역 테이블의 독립 복사본 (격리된 유닛용)
    pub fn new_symbols(&self) -> SharedSymbols {
        self.symbols.read().clone().into_shared()
    }

    /// 이름으로 유닛에 접근. 접근하는 동안 unload/close는 대기한다
    ///
    /// 재귀 읽기 락을 사용하므로 `f` 안에서 다시 조회해도 대기 중인 쓰기 작업에 막히지 않는다.
    /// `f` 안에서 같은 레지스트리를 변경하면 교착된다.
    pub fn with_unit<R>(&self, name: &str, f: impl FnOnce(&Unit) -> R) -> Result<R> {
        let modules = self.modules.read_recursive();
        let unit = modules
            .get(name)
            .ok_or_else(|| Error::NotExists(name.to_owned()))?;
        Ok(f(unit))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read_recursive().contains_key(name)
    }

    /// 등록된 이름 (정렬됨)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read_recursive().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn symbols(&self) -> HashMap<String, usize> {
        self.symbols.read().snapshot()
    }

    // ========================================================================
    // 종료
    // ========================================================================

    /// 모든 유닛 해제 후 테이블을 호스트 심볼만으로 재설정
    ///
    /// 해제 순서는 정해져 있지 않다. 출력은 항상 flush한다.
    pub fn close(&self) -> Result<()> {
        let mut modules = self.modules.write();
        for (name, mut unit) in modules.drain() {
            self.release(&name, &unit);
            unit.free(true);
        }
        let table = host_table(self.linker.as_ref())?;
        *self.symbols.write() = table;
        info!("[global] closed");
        Ok(())
    }
}

fn host_table(linker: &dyn Linker) -> Result<SymbolTable> {
    let mut table = SymbolTable::new();
    linker
        .register_host_symbols(&mut table)
        .map_err(Error::linker("register host symbols"))?;
    Ok(table)
}
