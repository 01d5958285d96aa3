// Print macros for kernel output

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::drivers::console::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host builds: evaluate the arguments (so the call sites typecheck) but
// discard the output; tests observe the console through its buffer instead.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[macro_export]
macro_rules! println {
    () => {{}};
    ($($arg:tt)*) => {{ let _ = format_args!($($arg)*); }};
}
