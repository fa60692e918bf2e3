// src/macros.rs
#[macro_export]
macro_rules! task {
    (|$cx:ident| $body:block) => {
        $crate::FnTask(move |$cx: &mut $crate::Cx<'_>| $body)
    };
}

/// Diagnostic line prefixed with the milliseconds elapsed since scheduler
/// start, zero-padded to four digits: `[0042]: ...`.
#[macro_export]
macro_rules! dprintfn {
    ($($arg:tt)*) => {
        $crate::clock::dprint(::std::format_args!($($arg)*))
    };
}
