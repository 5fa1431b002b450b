//! Worker threads that Wine is allowed to see.
//!
//! Plugins assume the threads that call into them were created through the
//! Win32 API, because that is the only way a thread gets the thread-local
//! state Wine maintains. On Windows builds the wrapper therefore goes
//! through `CreateThread`; elsewhere a plain std thread is equivalent and
//! keeps the crate testable on the build host.

use tracing::warn;

/// A joinable worker thread. Joining happens on drop, so a session tears
/// down by simply letting its threads go out of scope.
pub struct RunnerThread {
    inner: Option<ThreadHandle>,
}

impl RunnerThread {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self {
            inner: Some(spawn_impl(name, body)?),
        })
    }
}

impl Drop for RunnerThread {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.take() {
            if join_impl(handle).is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

#[cfg(not(windows))]
type ThreadHandle = std::thread::JoinHandle<()>;

#[cfg(not(windows))]
fn spawn_impl<F>(name: &str, body: F) -> std::io::Result<ThreadHandle>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(body)
}

#[cfg(not(windows))]
fn join_impl(handle: ThreadHandle) -> Result<(), ()> {
    handle.join().map_err(|_| ())
}

#[cfg(windows)]
type ThreadHandle = windows::Win32::Foundation::HANDLE;

#[cfg(windows)]
fn spawn_impl<F>(_name: &str, body: F) -> std::io::Result<ThreadHandle>
where
    F: FnOnce() + Send + 'static,
{
    use windows::Win32::System::Threading::CreateThread;

    unsafe extern "system" fn trampoline(parameter: *mut std::ffi::c_void) -> u32 {
        // SAFETY: the box was leaked by spawn_impl below and is entered
        // exactly once.
        let body = unsafe { Box::from_raw(parameter as *mut Box<dyn FnOnce() + Send>) };
        body();
        0
    }

    let body: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(body));
    let parameter = Box::into_raw(body) as *mut std::ffi::c_void;
    // SAFETY: the trampoline takes ownership of `parameter`; on spawn
    // failure we reclaim it ourselves.
    match unsafe {
        CreateThread(
            None,
            0,
            Some(trampoline),
            Some(parameter as *const std::ffi::c_void),
            Default::default(),
            None,
        )
    } {
        Ok(handle) => Ok(handle),
        Err(e) => {
            drop(unsafe { Box::from_raw(parameter as *mut Box<dyn FnOnce() + Send>) });
            Err(std::io::Error::other(e))
        }
    }
}

#[cfg(windows)]
fn join_impl(handle: ThreadHandle) -> Result<(), ()> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{WaitForSingleObject, INFINITE};

    // SAFETY: handle came from CreateThread and is closed exactly once.
    unsafe {
        WaitForSingleObject(handle, INFINITE);
        let _ = CloseHandle(handle);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drop_joins_the_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let thread = RunnerThread::spawn("test-worker", move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        drop(thread);
        assert!(ran.load(Ordering::SeqCst));
    }
}
