//! 심볼 테이블 및 심볼 핸들
//!
//! 유닛들이 서로의 심볼과 호스트 심볼을 참조할 수 있도록 공유 테이블 관리
//! - 호스트 심볼 시딩 (링커 협력자 경유)
//! - 유닛 export 병합 (first-definer-wins) / 해제 (exact-match)
//! - 타입 디스크립터 레지스트리 동봉

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::TypeRegistry;

/// 여러 유닛이 공유하는 심볼 테이블
pub type SharedSymbols = Arc<RwLock<SymbolTable>>;

/// 정규화된 이름 → 런타임 주소
///
/// 주소는 그 주소를 정의한 유닛이 Linked 상태인 동안만 유효하다.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, usize>,
    types: TypeRegistry,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 공유 가능한 테이블로 변환
    pub fn into_shared(self) -> SharedSymbols {
        Arc::new(RwLock::new(self))
    }

    /// 심볼 조회
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    /// 심볼 등록 (기존 항목이 있으면 교체)
    ///
    /// 시딩 전용. 유닛 export는 [`SymbolTable::merge`]를 사용한다.
    pub fn register(&mut self, name: &str, address: usize) -> Option<usize> {
        self.symbols.insert(name.to_owned(), address)
    }

    /// 심볼 해제
    pub fn unregister(&mut self, name: &str) -> bool {
        self.symbols.remove(name).is_some()
    }

    /// 유닛 export 병합
    ///
    /// 이미 존재하는 이름은 절대 덮어쓰지 않는다. 추가된 개수 반환.
    pub fn merge(&mut self, exports: &HashMap<String, usize>) -> usize {
        let mut added = 0;
        for (name, &address) in exports {
            if !self.symbols.contains_key(name) {
                self.symbols.insert(name.clone(), address);
                added += 1;
            }
        }
        added
    }

    /// 유닛 export 해제
    ///
    /// 현재 주소가 그 유닛이 기여한 주소와 같을 때만 삭제한다.
    /// 다른 유닛이 소유한 항목은 건드리지 않는다. 삭제된 개수 반환.
    pub fn unmerge(&mut self, exports: &HashMap<String, usize>) -> usize {
        let mut removed = 0;
        for (name, &address) in exports {
            if self.symbols.get(name) == Some(&address) {
                self.symbols.remove(name);
                removed += 1;
            }
        }
        removed
    }

    /// 등록된 심볼 이름 (정렬됨)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.symbols.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// 등록된 심볼 목록 복사본
    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.symbols.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.iter().map(|(n, a)| (n.as_str(), *a))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// 심볼과 타입 모두 비움
    pub fn clear(&mut self) {
        self.symbols.clear();
        self.types.clear();
    }
}

// ============================================================================
// 심볼 핸들
// ============================================================================

/// 링크된 유닛 안의 심볼 주소를 담는 불투명 핸들
///
/// 호출 가능한 값으로 바꾸는 방법은 두 가지다.
///
/// - [`Sym::cast_once`]: 핸들을 소비하고 주소 비트를 [`OnceFn`] 안에 복사한다.
///   함수 포인터는 래퍼 밖으로 나오지 않고, [`OnceFn::call`]이 래퍼를 소비하므로
///   변환 한 번에 호출은 정확히 한 번이다. 다시 호출하려면 유닛에서 새로 fetch 한다.
/// - [`Sym::cast_ref`]: 핸들의 저장 위치 자체를 `F`로 해석한다. 결과는 핸들을
///   빌리므로 핸들이 살아 있는 동안 몇 번이든 호출할 수 있고, 핸들 저장 공간이
///   재사용되기 전에 빌림이 끝나는 것을 컴파일러가 보장한다.
///
/// 두 방법 모두 `F`는 주소 하나 크기의 타입(함수 포인터)이어야 하며,
/// 심볼을 정의한 유닛이 Linked 상태로 남아 있어야 한다.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sym(usize);

impl Sym {
    pub const fn from_addr(address: usize) -> Self {
        Self(address)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// 단일 사용 변환
    ///
    /// # Safety
    ///
    /// `F`는 심볼의 실제 시그니처와 일치하는 함수 포인터 타입이어야 하고,
    /// 반환된 값을 호출하는 시점까지 심볼 소유 유닛이 해제되면 안 된다.
    pub unsafe fn cast_once<F: FnPtr>(self) -> OnceFn<F> {
        const { assert_address_sized::<F>() };
        let f = unsafe { std::mem::transmute_copy::<usize, F>(&self.0) };
        OnceFn {
            f,
            _not_send: PhantomData,
        }
    }

    /// 안정 참조 변환
    ///
    /// 반환된 참조는 `self`의 저장 위치를 가리킨다.
    ///
    /// # Safety
    ///
    /// `F`는 심볼의 실제 시그니처와 일치하는 함수 포인터 타입이어야 하고,
    /// 참조가 살아 있는 동안 심볼 소유 유닛이 해제되면 안 된다.
    pub unsafe fn cast_ref<F: Copy>(&self) -> &F {
        const { assert_address_sized::<F>() };
        unsafe { &*(self as *const Sym as *const F) }
    }
}

impl From<Sym> for usize {
    fn from(sym: Sym) -> usize {
        sym.0
    }
}

const fn assert_address_sized<F>() {
    assert!(size_of::<F>() == size_of::<usize>(), "symbol cast target must be address sized");
    assert!(align_of::<F>() <= align_of::<usize>(), "symbol cast target over-aligned");
}

mod sealed {
    pub trait Sealed {}
}

/// 심볼 변환 대상이 될 수 있는 함수 포인터 타입
///
/// 인자는 튜플로 묶는다: `fn()`은 `()`, `fn(u64)`는 `(u64,)`.
/// 인자 개수 0~6의 `fn`과 `extern "C" fn`에 구현되어 있다.
pub trait FnPtr: Copy + sealed::Sealed {
    type Args;
    type Output;

    #[doc(hidden)]
    fn call_with(self, args: Self::Args) -> Self::Output;
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> sealed::Sealed for fn($($arg),*) -> R {}
        impl<R, $($arg),*> sealed::Sealed for extern "C" fn($($arg),*) -> R {}

        impl<R, $($arg),*> FnPtr for fn($($arg),*) -> R {
            type Args = ($($arg,)*);
            type Output = R;

            #[allow(non_snake_case)]
            fn call_with(self, ($($arg,)*): Self::Args) -> R {
                self($($arg),*)
            }
        }

        impl<R, $($arg),*> FnPtr for extern "C" fn($($arg),*) -> R {
            type Args = ($($arg,)*);
            type Output = R;

            #[allow(non_snake_case)]
            fn call_with(self, ($($arg,)*): Self::Args) -> R {
                self($($arg),*)
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A);
impl_fn_ptr!(A, B);
impl_fn_ptr!(A, B, C);
impl_fn_ptr!(A, B, C, D);
impl_fn_ptr!(A, B, C, D, E);
impl_fn_ptr!(A, B, C, D, E, G);

/// [`Sym::cast_once`] 결과. 한 번 호출하면 소비된다.
///
/// 변환된 함수 포인터를 꺼내는 방법은 없다.
///
/// ```compile_fail
/// use hotmod::Sym;
///
/// fn answer() -> u32 {
///     42
/// }
///
/// let sym = Sym::from_addr(answer as fn() -> u32 as usize);
/// let once = unsafe { sym.cast_once::<fn() -> u32>() };
/// once.call(());
/// once.call(());
/// ```
pub struct OnceFn<F> {
    f: F,
    // 변환한 스레드 안에서 바로 사용
    _not_send: PhantomData<*const ()>,
}

impl<F: FnPtr> OnceFn<F> {
    /// 변환된 함수를 `args`로 한 번 호출
    pub fn call(self, args: F::Args) -> F::Output {
        self.f.call_with(args)
    }
}
