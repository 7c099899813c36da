//! 테스트용 링커 협력자
//!
//! object 파일 대신 텍스트 매니페스트를 읽고, 심볼 주소로는
//! 호스트에 미리 컴파일된 함수의 주소를 사용한다.
//!
//! 매니페스트 한 줄에 지시어 하나:
//! - `def <name> <host-fn>`: 심볼 정의 (이름에 `.`이 없으면 이름공간 접두)
//! - `ref <qualified name>`: 외부 심볼 참조
//! - `iface <type name>`: 링크 전에 등록되어 있어야 하는 타입 디스크립터
//! - `namespace <ns>`: 직렬화된 계획에서 object 경계
//! - `dep <qualified name> <host-fn>`: 직렬화된 계획의 의존성 심볼

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::module::{
    BoxError, CodeModule, Dependency, Linker, LinkerState, NAMESPACE_SEPARATOR, SymbolTable, qualify,
};

pub(crate) type Entry = fn() -> &'static str;
pub(crate) type Square = fn(u64) -> u64;

// ============================================================
// 호스트 함수 (모듈 코드 역할)
// ============================================================

fn constant() -> &'static str {
    "constant"
}

fn constant_v2() -> &'static str {
    "constant v2"
}

fn alpha() -> &'static str {
    "alpha"
}

fn beta() -> &'static str {
    "beta"
}

fn gamma() -> &'static str {
    "gamma"
}

fn square(x: u64) -> u64 {
    x * x
}

fn failing() -> &'static str {
    panic!("module code failed")
}

static PRINTED: AtomicU64 = AtomicU64::new(0);

fn println() -> &'static str {
    PRINTED.fetch_add(1, Ordering::Relaxed);
    "printed"
}

fn host_function(key: &str) -> Option<usize> {
    let address = match key {
        "constant" => constant as Entry as usize,
        "constant_v2" => constant_v2 as Entry as usize,
        "alpha" => alpha as Entry as usize,
        "beta" => beta as Entry as usize,
        "gamma" => gamma as Entry as usize,
        "square" => square as Square as usize,
        "failing" => failing as Entry as usize,
        "println" => println as Entry as usize,
        _ => return None,
    };
    Some(address)
}

pub(crate) fn host_address(key: &str) -> usize {
    host_function(key).unwrap_or_else(|| panic!("unknown host function {key}"))
}

// ============================================================
// 링커 상태 / 코드 모듈
// ============================================================

#[derive(Debug, Clone, Default)]
struct ObjectPlan {
    namespace: String,
    defs: Vec<(String, String)>,
    refs: Vec<String>,
    ifaces: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct TestPlan {
    objects: Vec<ObjectPlan>,
    deps: Vec<(String, String)>,
}

impl TestPlan {
    fn defines(&self, name: &str) -> bool {
        self.objects
            .iter()
            .flat_map(|o| o.defs.iter())
            .chain(self.deps.iter())
            .any(|(n, _)| n == name)
    }

    fn unresolved(&self, table: &SymbolTable) -> Vec<String> {
        let mut missing: Vec<String> = self
            .objects
            .iter()
            .flat_map(|o| o.refs.iter())
            .filter(|r| !table.contains(r) && !self.defines(r))
            .cloned()
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}

struct TestModule {
    label: String,
    symbols: HashMap<String, usize>,
}

impl CodeModule for TestModule {
    fn symbols(&self) -> &HashMap<String, usize> {
        &self.symbols
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

fn qualify_in(namespace: &str, name: &str) -> String {
    if name.contains(NAMESPACE_SEPARATOR) {
        name.to_owned()
    } else {
        qualify(namespace, name)
    }
}

fn parse_object(text: &str, namespace: &str) -> Result<ObjectPlan, BoxError> {
    let mut object = ObjectPlan {
        namespace: namespace.to_owned(),
        ..ObjectPlan::default()
    };
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
        let (directive, rest) = line.split_once(' ').unwrap_or((line, ""));
        match directive {
            "def" => {
                let (name, key) = rest
                    .split_once(' ')
                    .ok_or_else(|| format!("malformed def: {line}"))?;
                if host_function(key).is_none() {
                    return Err(format!("unknown host function {key}").into());
                }
                object.defs.push((qualify_in(namespace, name), key.to_owned()));
            }
            "ref" => object.refs.push(rest.to_owned()),
            "iface" => object.ifaces.push(rest.to_owned()),
            _ => return Err(format!("unknown directive: {line}").into()),
        }
    }
    Ok(object)
}

fn plan_of(state: &LinkerState) -> Result<&TestPlan, BoxError> {
    state
        .downcast_ref::<TestPlan>()
        .ok_or_else(|| "foreign linker state".into())
}

// ============================================================
// 링커
// ============================================================

/// 매니페스트 기반 링커. 호출 이벤트를 순서대로 기록한다.
#[derive(Default)]
pub(crate) struct TestLinker {
    events: Mutex<Vec<String>>,
}

impl TestLinker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// 언로드된 모듈 라벨 (언로드 순서)
    pub(crate) fn unloads(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("unload:"))
            .map(str::to_owned)
            .collect()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn register_manifest(&self, table: &mut SymbolTable, path: &Path) -> Result<(), BoxError> {
        let text = fs::read_to_string(path)?;
        let object = parse_object(&text, "host")?;
        for (name, key) in &object.defs {
            table.register(name, host_address(key));
        }
        Ok(())
    }
}

impl Linker for TestLinker {
    fn parse(&self, files: &[PathBuf], namespaces: &[String]) -> Result<LinkerState, BoxError> {
        let mut plan = TestPlan::default();
        for (file, namespace) in files.iter().zip(namespaces) {
            let text = fs::read_to_string(file)?;
            plan.objects.push(parse_object(&text, namespace)?);
        }
        self.record(format!("parse:{}", namespaces.join(",")));
        Ok(Box::new(plan))
    }

    fn parse_serialized(&self, input: &mut dyn Read) -> Result<LinkerState, BoxError> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;
        let mut plan = TestPlan::default();
        let mut current: Option<(String, String)> = None;
        let flush = |current: &mut Option<(String, String)>, plan: &mut TestPlan| -> Result<(), BoxError> {
            if let Some((namespace, body)) = current.take() {
                plan.objects.push(parse_object(&body, &namespace)?);
            }
            Ok(())
        };
        for line in text.lines() {
            if let Some(namespace) = line.strip_prefix("namespace ") {
                flush(&mut current, &mut plan)?;
                current = Some((namespace.to_owned(), String::new()));
            } else if let Some(dep) = line.strip_prefix("dep ") {
                let (name, key) = dep.split_once(' ').ok_or("malformed dep")?;
                plan.deps.push((name.to_owned(), key.to_owned()));
            } else if let Some((_, body)) = current.as_mut() {
                body.push_str(line);
                body.push('\n');
            }
        }
        flush(&mut current, &mut plan)?;
        self.record("parse-serialized".to_owned());
        Ok(Box::new(plan))
    }

    fn plan_namespaces(&self, state: &LinkerState) -> Vec<String> {
        let mut namespaces: Vec<String> = Vec::new();
        if let Ok(plan) = plan_of(state) {
            for object in &plan.objects {
                if !namespaces.contains(&object.namespace) {
                    namespaces.push(object.namespace.clone());
                }
            }
        }
        namespaces
    }

    fn resolve_dependency(
        &self,
        state: &mut LinkerState,
        dependency: &Dependency,
        _table: &SymbolTable,
    ) -> Result<(), BoxError> {
        let plan = state
            .downcast_mut::<TestPlan>()
            .ok_or("foreign linker state")?;
        let text = fs::read_to_string(&dependency.file)?;
        let object = parse_object(&text, &dependency.namespace)?;
        for wanted in &dependency.symbols {
            let wanted = qualify_in(&dependency.namespace, wanted);
            let def = object
                .defs
                .iter()
                .find(|(n, _)| *n == wanted)
                .ok_or_else(|| format!("dependency does not define {wanted}"))?;
            plan.deps.push(def.clone());
        }
        self.record(format!("dependency:{}", dependency.namespace));
        Ok(())
    }

    fn load(&self, state: &LinkerState, table: &SymbolTable) -> Result<Box<dyn CodeModule>, BoxError> {
        let plan = plan_of(state)?;
        for object in &plan.objects {
            if let Some(missing) = object.ifaces.iter().find(|t| !table.types().contains(t)) {
                return Err(format!("missing type descriptor {missing}").into());
            }
        }
        if let Some(missing) = plan.unresolved(table).first() {
            return Err(format!("unresolved symbol {missing}").into());
        }
        let symbols = plan
            .objects
            .iter()
            .flat_map(|o| o.defs.iter())
            .chain(plan.deps.iter())
            .map(|(name, key)| (name.clone(), host_address(key)))
            .collect();
        let label = self.plan_namespaces(state).join(",");
        self.record(format!("load:{label}"));
        Ok(Box::new(TestModule { label, symbols }))
    }

    fn unresolved_symbols(&self, state: &LinkerState, table: &SymbolTable) -> Vec<String> {
        plan_of(state).map(|p| p.unresolved(table)).unwrap_or_default()
    }

    fn serialize_state(&self, state: &LinkerState, output: &mut dyn Write) -> Result<(), BoxError> {
        let plan = plan_of(state)?;
        for object in &plan.objects {
            writeln!(output, "namespace {}", object.namespace)?;
            for (name, key) in &object.defs {
                writeln!(output, "def {name} {key}")?;
            }
            for name in &object.refs {
                writeln!(output, "ref {name}")?;
            }
            for name in &object.ifaces {
                writeln!(output, "iface {name}")?;
            }
        }
        for (name, key) in &plan.deps {
            writeln!(output, "dep {name} {key}")?;
        }
        Ok(())
    }

    fn unload(&self, module: Box<dyn CodeModule>) {
        if let Ok(module) = module.into_any().downcast::<TestModule>() {
            self.record(format!("unload:{}", module.label));
        }
    }

    fn register_host_symbols(&self, table: &mut SymbolTable) -> Result<(), BoxError> {
        table.register("fmt.Println", host_address("println"));
        table.register("runtime.Square", host_address("square"));
        self.record("host".to_owned());
        Ok(())
    }

    fn register_library_symbols(&self, table: &mut SymbolTable, path: &Path) -> Result<(), BoxError> {
        self.register_manifest(table, path)?;
        self.record(format!("library:{}", path.display()));
        Ok(())
    }

    fn register_executable_symbols(&self, table: &mut SymbolTable, path: &Path) -> Result<(), BoxError> {
        self.register_manifest(table, path)?;
        self.record(format!("executable:{}", path.display()));
        Ok(())
    }
}

// ============================================================
// 픽스처
// ============================================================

/// 임시 디렉토리에 매니페스트 object 파일 작성
pub(crate) struct Fixtures {
    dir: TempDir,
}

impl Fixtures {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create fixture dir"),
        }
    }

    pub(crate) fn object(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
