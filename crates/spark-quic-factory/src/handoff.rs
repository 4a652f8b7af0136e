//! # handoff：跨线程构造与阻塞交接
//!
//! ## 意图（Why）
//! - 传输引擎对象只能在其归属的执行上下文上构造；而工厂的嵌入面是同步的（调用/返回），
//!   不能向外暴露异步句柄。本模块把“投递构造闭包 + 阻塞等待结果”收敛为一个原语。
//!
//! ## 逻辑（How）
//! 1. 分配一次性的 [`CompletionCell`]（`parking_lot::Mutex` + `Condvar`），由调用线程与工作线程共享；
//! 2. 向目标上下文投递闭包：构造对象，把成功值或捕获到的 [`ConstructionError`] 写入结果槽并发出信号；
//! 3. 调用线程无超时地阻塞在完成单元上；
//! 4. 收到信号后取出结果槽并返回。
//!
//! ## 契约（What）
//! - 投递失败（上下文已停止）时立即返回 `ContextUnavailable`，调用线程不会进入等待；
//! - 闭包在写入结果前被销毁（闭包 panic、运行时提前销毁派生 Future）时，[`Completer`] 的 `Drop`
//!   写入 [`ConstructionError::Abandoned`]，调用方永远只会得到结构完整的成功/失败结果；
//! - 在目标上下文自身的工作线程上调用阻塞原语返回 `ReentrantCall`，而不是自我死锁。
//!
//! ## 风险（Trade-offs）
//! - 没有取消机制：闭包一旦投递就会执行到底；构造闭包应保持短小且有界。
//! - 完成单元的写入/销毁与等待之间的交错由 `loom` 模型穷举，运行方式：
//!   `RUSTFLAGS="--cfg loom" cargo test -p spark-quic-factory --lib handoff::loom_model`。

use std::future::Future;

use crate::{
    context::ExecutionContext,
    error::{ConstructionError, FactoryError},
};

use self::sync::{Arc, Condvar, Mutex};

/// 完成单元使用的同步原语；`cfg(loom)` 下切换为 `loom` 的可建模实现。
#[cfg(not(loom))]
mod sync {
    pub(crate) use parking_lot::{Condvar, Mutex, MutexGuard};
    pub(crate) use std::sync::Arc;

    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock()
    }

    pub(crate) fn wait<'a, T>(signal: &Condvar, mut guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        signal.wait(&mut guard);
        guard
    }
}

#[cfg(loom)]
mod sync {
    pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard};
    use std::sync::PoisonError;

    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a, T>(signal: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// 单生产者/单消费者的一次性完成单元。
pub(crate) struct CompletionCell<T> {
    slot: Mutex<Option<Result<T, ConstructionError>>>,
    signal: Condvar,
}

impl<T> CompletionCell<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        })
    }

    fn wait(&self) -> Result<T, ConstructionError> {
        let mut slot = sync::lock(&self.slot);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = sync::wait(&self.signal, slot);
        }
    }
}

/// 完成单元的写端；只能写入一次，未写入即被销毁时自动写入 `Abandoned`。
pub(crate) struct Completer<T> {
    cell: Option<Arc<CompletionCell<T>>>,
}

impl<T> Completer<T> {
    fn complete(mut self, result: Result<T, ConstructionError>) {
        if let Some(cell) = self.cell.take() {
            Self::fill(&cell, result);
        }
    }

    fn fill(cell: &CompletionCell<T>, result: Result<T, ConstructionError>) {
        let mut slot = sync::lock(&cell.slot);
        *slot = Some(result);
        cell.signal.notify_one();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            Self::fill(&cell, Err(ConstructionError::Abandoned));
        }
    }
}

fn completion_pair<T>() -> (Completer<T>, Arc<CompletionCell<T>>) {
    let cell = CompletionCell::new();
    (
        Completer {
            cell: Some(Arc::clone(&cell)),
        },
        cell,
    )
}

fn ensure_not_reentrant(context: &ExecutionContext) -> Result<(), FactoryError> {
    if context.is_current() {
        tracing::error!(
            context = %context.name(),
            "blocking handoff issued from the target context's own worker"
        );
        return Err(FactoryError::ReentrantCall {
            context: context.name().to_owned(),
        });
    }
    Ok(())
}

/// 在 `context` 上构造对象并阻塞等待结果。
///
/// 构造闭包返回的 [`ConstructionError`] 原样经由结果槽带回，包装为 [`FactoryError::Construction`]。
pub fn construct_on<T, F>(context: &ExecutionContext, build: F) -> Result<T, FactoryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ConstructionError> + Send + 'static,
{
    ensure_not_reentrant(context)?;
    let (completer, cell) = completion_pair();
    context.post(move || completer.complete(build()))?;
    cell.wait().map_err(FactoryError::from)
}

/// 在 `context` 上执行不会失败的闭包并返回其结果。
pub fn run_on<T, F>(context: &ExecutionContext, f: F) -> Result<T, FactoryError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    construct_on(context, move || Ok(f()))
}

/// 在 `context` 的运行时上驱动 `make_future` 产出的 Future，并阻塞等待其完成。
///
/// `make_future` 本身在工作线程上调用，因此可以安全地触碰只属于该上下文的对象。
pub fn await_on<T, M, Fut>(context: &ExecutionContext, make_future: M) -> Result<T, FactoryError>
where
    T: Send + 'static,
    M: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    ensure_not_reentrant(context)?;
    let (completer, cell) = completion_pair();
    context.post(move || {
        let future = make_future();
        tokio::spawn(async move {
            let value = future.await;
            completer.complete(Ok(value));
        });
    })?;
    cell.wait().map_err(FactoryError::from)
}


#[cfg(all(test, loom))]
mod loom_model {
    use super::*;
    use loom::{model, thread};

    #[test]
    fn completed_value_reaches_the_waiter() {
        model(|| {
            let (completer, cell) = completion_pair::<u32>();
            let producer = thread::spawn(move || completer.complete(Ok(7)));
            // 无论写入发生在等待之前还是之后，等待方都必须拿到写入值，不会丢失唤醒。
            assert!(matches!(cell.wait(), Ok(7)));
            producer.join().expect("producer thread");
        });
    }

    #[test]
    fn dropped_completer_reports_abandoned() {
        model(|| {
            let (completer, cell) = completion_pair::<u32>();
            let producer = thread::spawn(move || drop(completer));
            assert!(matches!(cell.wait(), Err(ConstructionError::Abandoned)));
            producer.join().expect("producer thread");
        });
    }

    #[test]
    fn explicit_result_is_not_overwritten_by_drop() {
        model(|| {
            let (completer, cell) = completion_pair::<u32>();
            let producer = thread::spawn(move || {
                completer.complete(Err(ConstructionError::MissingHost {
                    url: "https://".into(),
                }))
            });
            assert!(matches!(
                cell.wait(),
                Err(ConstructionError::MissingHost { .. })
            ));
            producer.join().expect("producer thread");
        });
    }
}
