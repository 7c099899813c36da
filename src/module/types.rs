//! 타입 디스크립터 레지스트리
//!
//! 모듈 경계를 넘는 추상(인터페이스) 타입 값의 크기/정렬을
//! 링커가 올바르게 배치할 수 있도록 구체 타입 레이아웃을 등록한다.
//! 링커는 인터페이스 타입 심볼을 바인딩하기 전에 이 레지스트리를 조회한다.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::mem::{align_of, size_of};

/// 구체 타입 레이아웃 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// 타입 이름 (`std::any::type_name`)
    pub name: &'static str,
    pub id: TypeId,
    pub size: usize,
    pub align: usize,
}

impl TypeDescriptor {
    /// 샘플 타입으로부터 디스크립터 생성
    pub fn of<T: 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            id: TypeId::of::<T>(),
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    /// 값의 타입으로부터 디스크립터 생성
    pub fn of_val<T: 'static>(_: &T) -> Self {
        Self::of::<T>()
    }
}

/// 타입 이름 → 디스크립터
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<&'static str, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 디스크립터 등록 (같은 이름이면 교체)
    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.name, descriptor);
    }

    pub fn register_all(&mut self, descriptors: &[TypeDescriptor]) {
        for descriptor in descriptors {
            self.register(*descriptor);
        }
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn get_by_id(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.values().find(|d| d.id == id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn clear(&mut self) {
        self.types.clear();
    }
}
