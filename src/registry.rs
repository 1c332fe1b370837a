use super::{
    codec::Raised,
    model::ContextId,
    value::Value,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};


/// Функция, исполняемая внутри контекста. Видит только глобалы своего контекста.
pub type Callable = Arc<dyn Fn(&mut Globals, Args) -> anyhow::Result<Value> + Send + Sync>;

/// Неизменяемая таблица функций, доступных по имени в каждом контексте.
///
/// Таблица замораживается при создании пула: код общий, состояние у каждого контекста своё.
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut Globals, Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    /// Вариант `register` для цепочек при сборке
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Globals, Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<&Callable, Raised> {
        self.functions
            .get(name)
            .ok_or_else(|| Raised::lookup_error(format!("no function registered as `{}`", name)))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("functions", &names).finish()
    }
}


/// Глобальное состояние одного изолированного контекста
#[derive(Debug)]
pub struct Globals {
    context: ContextId,
    vars: HashMap<String, Value>,
}

impl Globals {
    pub(crate) fn new(context: ContextId) -> Self {
        Self {
            context,
            vars: HashMap::new(),
        }
    }

    #[inline]
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}


/// Аргументы вызова после декодирования внутри контекста
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>, keyword: BTreeMap<String, Value>) -> Self {
        Self { positional, keyword }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Позиционный аргумент с приведением типа, при отсутствии `TypeError`
    pub fn get<T>(&self, index: usize) -> Result<T, Raised>
    where
        T: TryFrom<Value, Error = Raised>,
    {
        let value = self.positional.get(index).cloned().ok_or_else(|| {
            Raised::type_error(format!(
                "missing positional argument {} (got {})",
                index,
                self.positional.len()
            ))
        })?;
        T::try_from(value)
    }

    pub fn kwarg<T>(&self, name: &str) -> Result<Option<T>, Raised>
    where
        T: TryFrom<Value, Error = Raised>,
    {
        self.keyword.get(name).cloned().map(T::try_from).transpose()
    }

    pub fn into_parts(self) -> (Vec<Value>, BTreeMap<String, Value>) {
        (self.positional, self.keyword)
    }
}
