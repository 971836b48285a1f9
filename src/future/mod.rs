//! Completion futures bridging the event loop and its callers.
//!
//! Every operation a file handle accepts is answered by a
//! [`CompletionFuture`]. The loop thread resolves it; callers on any thread
//! block on it, await it, or attach a handler.
//!
//! ```rust,no_run
//! # use uring_file::CompletionFuture;
//! let future: CompletionFuture = CompletionFuture::new();
//! let observer = future.clone();
//! std::thread::spawn(move || future.complete(512));
//! assert_eq!(observer.join().unwrap(), 512);
//! ```

mod completion;
mod waker;


pub use completion::CompletionFuture;
