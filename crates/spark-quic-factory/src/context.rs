use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::FactoryError;

/// 投递到执行上下文的任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 执行上下文的启动参数。
#[derive(Clone, Debug)]
pub struct ContextOptions {
    /// 诊断名称，同时作为工作线程的操作系统线程名。
    pub name: String,
    /// 工作线程栈大小；`None` 表示沿用标准库默认值。
    pub stack_size: Option<usize>,
}

impl ContextOptions {
    /// 以名称构造默认参数。
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
        }
    }
}

/// 拥有独立任务队列的命名后台工作线程。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - **线程亲和**：`quinn` 端点在创建时会绑定当前 Tokio 运行时，驱动任务也随之固定在该运行时上；
///   工厂必须保证端点只在其归属的工作线程上创建与驱动，调用方线程不参与；
/// - **顺序保证**：同一上下文内的任务严格按投递顺序执行，跨上下文不提供任何顺序承诺。
///
/// ## 逻辑（How）
/// - `start` 派生恰好一个工作线程，线程内构建单线程（current-thread）Tokio 运行时，并在 `block_on`
///   中循环消费无界 `mpsc` 队列；
/// - 闭包在运行时上下文内同步执行，因此可以直接创建 `quinn::Endpoint` 或调用 `tokio::spawn`；
/// - `stop` 关闭发送端后，工作线程会先排空已入队的任务，再退出循环并销毁运行时。
///
/// ## 契约（What）
/// - 构造即启动，类型层面杜绝重复 `start`；
/// - `post` 在 `stop` 开始后返回 [`FactoryError::ContextUnavailable`]，任务不会被静默丢弃；
/// - `stop` 幂等；在工作线程自身上调用时只关闭队列、不等待 join，避免自我死锁。
///
/// ## 风险与注意（Trade-offs）
/// - 运行时在队列排空后即被销毁，仍在运行的派生 Future 会被取消；需要跨越停机的异步工作应在停机前自行收尾；
/// - 任务 panic 被工作线程捕获并以 error 级别记录，队列继续排空；panic 闭包持有的完成单元写端
///   随栈展开销毁，调用方得到 [`ConstructionError::Abandoned`](crate::error::ConstructionError::Abandoned)。
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    name: String,
    sender: Mutex<Option<UnboundedSender<Task>>>,
    running: AtomicBool,
    worker_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// 创建并启动执行上下文。
    ///
    /// - **前置条件**：`options.name` 非空（由配置层校验）；
    /// - **后置条件**：返回时工作线程已派生，运行时已构建完成，可以立即接受任务；
    /// - **失败**：线程派生或运行时构建失败时返回 [`FactoryError::ContextSpawn`]。
    pub fn start(options: ContextOptions) -> Result<Self, FactoryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| FactoryError::ContextSpawn {
                context: options.name.clone(),
                source,
            })?;
        let (sender, receiver) = unbounded_channel();

        let mut builder = thread::Builder::new().name(options.name.clone());
        if let Some(size) = options.stack_size {
            builder = builder.stack_size(size);
        }
        let worker_name = options.name.clone();
        let join = builder
            .spawn(move || run_worker(worker_name, runtime, receiver))
            .map_err(|source| FactoryError::ContextSpawn {
                context: options.name.clone(),
                source,
            })?;

        tracing::debug!(context = %options.name, "execution context started");
        Ok(Self {
            inner: Arc::new(ContextInner {
                name: options.name,
                sender: Mutex::new(Some(sender)),
                running: AtomicBool::new(true),
                worker_id: join.thread().id(),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    /// 诊断名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 上下文是否仍在接受任务。
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// 当前线程是否就是该上下文的工作线程。
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.worker_id
    }

    /// 投递闭包，按投递顺序在工作线程上执行。
    pub fn post<F>(&self, task: F) -> Result<(), FactoryError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender
                .send(Box::new(task))
                .map_err(|_| self.unavailable()),
            None => Err(self.unavailable()),
        }
    }

    /// 把 Future 派生到该上下文的运行时上。
    ///
    /// 派生动作本身同样经过任务队列，因此与之前投递的闭包保持先后顺序。
    pub fn spawn<F>(&self, future: F) -> Result<(), FactoryError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.post(move || {
            tokio::spawn(future);
        })
    }

    /// 停止上下文：拒绝新任务，排空已入队任务并等待工作线程退出。
    pub fn stop(&self) {
        let sender = self.inner.sender.lock().take();
        self.inner.running.store(false, Ordering::Release);
        if sender.is_none() {
            return;
        }
        // 丢弃发送端即关闭队列，工作线程会在排空后退出。
        drop(sender);

        if self.is_current() {
            tracing::warn!(
                context = %self.inner.name,
                "stop requested from the worker thread itself, skipping join"
            );
            return;
        }
        let join = self.inner.join.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!(context = %self.inner.name, "execution context worker panicked");
            }
        }
        tracing::debug!(context = %self.inner.name, "execution context stopped");
    }

    /// 生成指向同一上下文的共享引用，供服务端、客户端对象持有。
    pub(crate) fn share(&self) -> ExecutionContext {
        ExecutionContext {
            inner: Arc::clone(&self.inner),
        }
    }

    fn unavailable(&self) -> FactoryError {
        FactoryError::ContextUnavailable {
            context: self.inner.name.clone(),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn run_worker(name: String, runtime: tokio::runtime::Runtime, mut receiver: UnboundedReceiver<Task>) {
    runtime.block_on(async {
        while let Some(task) = receiver.recv().await {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!(
                    context = %name,
                    panic = panic_message(payload.as_ref()),
                    "task panicked on execution context, worker keeps draining"
                );
            }
            // 让出一次，使本轮闭包派生的 Future 有机会在下一个任务前推进。
            tokio::task::yield_now().await;
        }
    });
    tracing::trace!(context = %name, "execution context queue drained");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
