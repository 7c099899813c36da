//! 모듈 레지스트리
//!
//! 하나의 공유 심볼 테이블과 이름공간으로 구분되는 유닛 집합 관리
//! - 로드 순서 기록
//! - export 병합 (first-definer-wins) / 해제 (exact-match)
//! - 안전한 reload/unload: 대상 이후에 로드된 유닛을 역순으로 모두 내린다
//!
//! 위치 i에 로드된 유닛의 심볼은 i 이후에 로드된 어떤 유닛이든 참조했을 수 있다.
//! 따라서 i를 내리려면 그 뒤의 유닛을 모두 먼저 내려야 한다.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::linker::Linker;
use super::qualify;
use super::symbol::{FnPtr, SharedSymbols, Sym, SymbolTable};
use super::types::TypeDescriptor;
use super::unit::Unit;
use crate::config::RegistryConfig;

/// 로드 순서상의 유닛 한 칸
struct Slot {
    id: u64,
    unit: Unit,
}

#[derive(Default)]
struct Inner {
    /// 이름공간 → 유닛 id (여러 이름공간이 같은 유닛을 가리킬 수 있음)
    modules: HashMap<String, u64>,
    /// 로드 순서
    loaded: Vec<Slot>,
    next_id: u64,
}

impl Inner {
    fn position(&self, id: u64) -> Option<usize> {
        self.loaded.iter().position(|s| s.id == id)
    }

    fn unit_of(&self, namespace: &str) -> Result<Option<&Unit>> {
        let Some(&id) = self.modules.get(namespace) else {
            return Ok(None);
        };
        let position = self.position(id).ok_or_else(|| missing_from_order(namespace))?;
        Ok(Some(&self.loaded[position].unit))
    }

    /// 주어진 이름공간들이 차지한 가장 앞선 로드 위치
    fn earliest_position(&self, namespaces: &[String]) -> Result<Option<usize>> {
        let mut earliest: Option<usize> = None;
        for namespace in namespaces {
            if let Some(&id) = self.modules.get(namespace) {
                let position = self.position(id).ok_or_else(|| missing_from_order(namespace))?;
                earliest = Some(earliest.map_or(position, |e| e.min(position)));
            }
        }
        Ok(earliest)
    }

    /// 로드 순서에 추가하고 export 병합
    fn admit(&mut self, namespaces: Vec<String>, unit: Unit, symbols: &SharedSymbols) {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(exports) = unit.module_symbols() {
            let added = symbols.write().merge(exports);
            debug!(
                "[registry] merged {} of {} symbols from {:?}",
                added,
                exports.len(),
                namespaces
            );
        }
        info!("[registry] {:?} loaded at position {}", namespaces, self.loaded.len());
        for namespace in namespaces {
            self.modules.insert(namespace, id);
        }
        self.loaded.push(Slot { id, unit });
    }

    /// `position`부터 끝까지 역순으로 언로드. 내려간 이름공간을 언로드 순서대로 반환
    fn evict_from(&mut self, position: usize, symbols: &SharedSymbols, flush: bool) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.loaded.len() > position {
            let Some(mut slot) = self.loaded.pop() else {
                break;
            };
            let mut names: Vec<String> = self
                .modules
                .iter()
                .filter(|(_, id)| **id == slot.id)
                .map(|(name, _)| name.clone())
                .collect();
            names.sort_unstable();
            for name in &names {
                self.modules.remove(name);
            }

            if let Some(exports) = slot.unit.module_symbols() {
                let removed = symbols.write().unmerge(exports);
                debug!("[registry] unmerged {} symbols of {:?}", removed, names);
            }
            slot.unit.free(flush);

            warn!("[registry] {:?} unloaded from position {}", names, self.loaded.len());
            evicted.extend(names);
        }
        evicted
    }
}

fn missing_from_order(namespace: &str) -> Error {
    Error::Corrupted(format!("'{namespace}' is registered but absent from load order"))
}

/// 모듈 레지스트리
///
/// 모든 변경 작업은 배타적 락, 조회는 공유 락 아래에서 수행한다.
/// 레지스트리가 소유한 유닛은 레지스트리를 통해서만 접근할 수 있다.
/// drop 시 모든 유닛을 로드 역순으로 내린다.
pub struct Registry {
    linker: Arc<dyn Linker>,
    symbols: SharedSymbols,
    config: RegistryConfig,
    inner: RwLock<Inner>,
}

impl Registry {
    /// 빈 심볼 테이블로 생성
    pub fn new(linker: Arc<dyn Linker>) -> Self {
        Self::with_config(linker, RegistryConfig::default())
    }

    pub fn with_config(linker: Arc<dyn Linker>, config: RegistryConfig) -> Self {
        Self::with_table(linker, SymbolTable::new(), config)
    }

    /// 미리 채운 심볼 테이블로 생성 (예: 전역 테이블 복사본)
    pub fn with_table(linker: Arc<dyn Linker>, table: SymbolTable, config: RegistryConfig) -> Self {
        Self {
            linker,
            symbols: table.into_shared(),
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn new_unit(&self) -> Unit {
        Unit::new(Arc::clone(&self.linker), Arc::clone(&self.symbols))
    }

    // ========================================================================
    // 시딩
    // ========================================================================

    /// 호스트 프로세스 심볼 등록
    pub fn register_host_symbols(&self) -> Result<()> {
        let _guard = self.inner.write();
        self.linker
            .register_host_symbols(&mut self.symbols.write())
            .map_err(Error::linker("register host symbols"))
    }

    /// 외부 동적 라이브러리 심볼 등록
    pub fn register_library_symbols(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.inner.write();
        self.linker
            .register_library_symbols(&mut self.symbols.write(), path.as_ref())
            .map_err(Error::linker("register library symbols"))
    }

    /// 외부 실행 파일 심볼 등록
    pub fn register_executable_symbols(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.inner.write();
        self.linker
            .register_executable_symbols(&mut self.symbols.write(), path.as_ref())
            .map_err(Error::linker("register executable symbols"))
    }

    /// 모든 유닛에 적용되는 타입 디스크립터 등록
    pub fn register_types(&self, types: &[TypeDescriptor]) {
        let _guard = self.inner.write();
        self.linker
            .register_type_descriptors(&mut self.symbols.write(), types);
    }

    // ========================================================================
    // 로드
    // ========================================================================

    fn build_file(&self, file: &Path, namespace: &str) -> Result<Unit> {
        let mut unit = self.new_unit();
        unit.initialize(file, namespace, &[])?;
        Ok(unit)
    }

    fn build_linkable(&self, input: &mut dyn Read) -> Result<(Unit, Vec<String>)> {
        let mut unit = self.new_unit();
        unit.initialize_serialized(input, &[])?;
        let namespaces = unit.namespaces().to_vec();
        if namespaces.is_empty() {
            return Err(Error::EmptyLinkPlan);
        }
        Ok((unit, namespaces))
    }

    /// object 파일 또는 아카이브 로드
    ///
    /// 실패하면 만들던 유닛은 해제되고 아무것도 등록되지 않는다.
    pub fn load_file(&self, file: impl AsRef<Path>, namespace: &str) -> Result<()> {
        let namespace = self.config.namespace_or_default(namespace).to_owned();
        let mut inner = self.inner.write();
        if inner.modules.contains_key(&namespace) {
            warn!("[registry] '{}' already loaded", namespace);
            return Err(Error::AlreadyLoaded(namespace));
        }
        let mut unit = self.build_file(file.as_ref(), &namespace)?;
        unit.link()?;
        inner.admit(vec![namespace], unit, &self.symbols);
        Ok(())
    }

    /// 직렬화된 링크 계획 로드. 계획이 선언한 모든 이름공간이 같은 유닛을 가리킨다
    pub fn load_linkable(&self, input: &mut dyn Read) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        let (mut unit, namespaces) = self.build_linkable(input)?;
        if let Some(namespace) = namespaces.iter().find(|n| inner.modules.contains_key(*n)) {
            warn!("[registry] '{}' already loaded", namespace);
            return Err(Error::AlreadyLoaded(namespace.clone()));
        }
        unit.link()?;
        inner.admit(namespaces.clone(), unit, &self.symbols);
        Ok(namespaces)
    }

    // ========================================================================
    // 교체 / 언로드
    // ========================================================================

    /// 로드된 이름공간을 새 object 파일로 교체
    ///
    /// 대상과 그 이후에 로드된 유닛을 모두 역순으로 내린 뒤 새 유닛을 로드한다.
    /// 함께 내려간 이름공간(언로드 순서)을 반환하므로 호출자가 필요한 것을 다시 로드한다.
    pub fn reload_file(&self, file: impl AsRef<Path>, namespace: &str) -> Result<Vec<String>> {
        let namespace = self.config.namespace_or_default(namespace).to_owned();
        let mut inner = self.inner.write();
        let position = inner
            .earliest_position(std::slice::from_ref(&namespace))?
            .ok_or_else(|| Error::NotLoaded(namespace.clone()))?;

        // 파싱은 테이블과 무관하므로 먼저 수행해 실패 시 아무것도 내리지 않는다
        let mut unit = self.build_file(file.as_ref(), &namespace)?;
        let evicted = inner.evict_from(position, &self.symbols, self.config.flush_on_free);
        unit.link()?;
        inner.admit(vec![namespace], unit, &self.symbols);
        Ok(evicted)
    }

    /// 직렬화된 링크 계획으로 교체
    pub fn reload_linkable(&self, input: &mut dyn Read) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        let (mut unit, namespaces) = self.build_linkable(input)?;
        let position = inner
            .earliest_position(&namespaces)?
            .ok_or_else(|| Error::NotLoaded(namespaces.join(",")))?;

        let evicted = inner.evict_from(position, &self.symbols, self.config.flush_on_free);
        unit.link()?;
        inner.admit(namespaces, unit, &self.symbols);
        Ok(evicted)
    }

    /// 이름공간과 그 이후에 로드된 유닛을 모두 역순으로 언로드
    pub fn unload(&self, namespace: &str) -> Result<Vec<String>> {
        let namespace = self.config.namespace_or_default(namespace).to_owned();
        let mut inner = self.inner.write();
        let position = inner
            .earliest_position(std::slice::from_ref(&namespace))?
            .ok_or(Error::NotLoaded(namespace))?;
        Ok(inner.evict_from(position, &self.symbols, self.config.flush_on_free))
    }

    // ========================================================================
    // 조회
    // ========================================================================

    /// 이름공간의 유닛을 찾아 공유 락 아래에서 `f` 실행
    ///
    /// 조회 경로는 재귀 읽기 락을 사용한다. 모듈 코드가 호출 중에 다시 레지스트리를
    /// 조회해도, 대기 중인 reload/unload 때문에 막히지 않는다.
    /// 호출 중에 같은 레지스트리를 변경(load/reload/unload)하면 교착된다.
    fn lookup<R>(&self, namespace: &str, f: impl FnOnce(&str, &Unit) -> Result<R>) -> Result<R> {
        let namespace = self.config.namespace_or_default(namespace);
        let inner = self.inner.read_recursive();
        let unit = inner
            .unit_of(namespace)?
            .ok_or_else(|| Error::MissingPackage(namespace.to_owned()))?;
        f(namespace, unit)
    }

    /// 이름공간의 심볼 조회
    pub fn require(&self, namespace: &str, symbol: &str) -> Result<Sym> {
        self.lookup(namespace, |namespace, unit| {
            unit.must_fetch(&qualify(namespace, symbol))
        })
    }

    /// 심볼을 조회해 공유 락을 쥔 채 `args`로 호출
    ///
    /// 호출이 끝날 때까지 reload/unload가 대기하므로 코드가 실행 중에 내려가지 않는다.
    ///
    /// # Safety
    ///
    /// `F`는 심볼의 실제 시그니처와 일치하는 함수 포인터 타입이어야 한다.
    pub unsafe fn invoke<F: FnPtr>(&self, namespace: &str, symbol: &str, args: F::Args) -> Result<F::Output> {
        self.lookup(namespace, |namespace, unit| unsafe {
            unit.invoke::<F>(&qualify(namespace, symbol), args)
        })
    }

    /// 이름공간의 유닛에 접근. 접근하는 동안 reload/unload는 대기한다
    pub fn with_unit<R>(&self, namespace: &str, f: impl FnOnce(&Unit) -> R) -> Result<R> {
        self.lookup(namespace, |_, unit| Ok(f(unit)))
    }

    pub fn is_loaded(&self, namespace: &str) -> bool {
        let namespace = self.config.namespace_or_default(namespace);
        self.inner.read_recursive().modules.contains_key(namespace)
    }

    /// 로드된 이름공간 (로드 순서)
    pub fn namespaces(&self) -> Vec<String> {
        let inner = self.inner.read_recursive();
        let mut namespaces = Vec::with_capacity(inner.modules.len());
        for slot in &inner.loaded {
            let mut names: Vec<&String> = inner
                .modules
                .iter()
                .filter(|(_, id)| **id == slot.id)
                .map(|(name, _)| name)
                .collect();
            names.sort_unstable();
            namespaces.extend(names.into_iter().cloned());
        }
        namespaces
    }

    /// 이름공간 유닛의 export 목록
    pub fn exports(&self, namespace: &str) -> Result<Vec<String>> {
        self.lookup(namespace, |_, unit| Ok(unit.exports()))
    }

    /// 공유 심볼 테이블 복사본
    pub fn symbols(&self) -> HashMap<String, usize> {
        self.symbols.read().snapshot()
    }

    /// 로드된 유닛 수
    pub fn len(&self) -> usize {
        self.inner.read_recursive().loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read_recursive().loaded.is_empty()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let flush = self.config.flush_on_free;
        let inner = self.inner.get_mut();
        if !inner.loaded.is_empty() {
            inner.evict_from(0, &self.symbols, flush);
        }
    }
}
