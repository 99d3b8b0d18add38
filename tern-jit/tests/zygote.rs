use tern_jit::{ArtMethod, MethodRef, ZygoteCompilationState, ZygoteMap, ZygoteMapView};

const BRIDGE: usize = 0x4000;

/// Runs `child` in a forked process and returns its exit status. The child
/// must not allocate: other test threads may hold the allocator lock at the
/// time of the fork.
fn run_in_child(child: impl FnOnce() -> i32) -> i32 {
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            let code = child();
            libc::_exit(code);
        }

        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        assert!(libc::WIFEXITED(status), "child did not exit normally");
        libc::WEXITSTATUS(status)
    }
}

fn zygote_methods() -> [(MethodRef, usize); 3] {
    [
        (ArtMethod::new("a", "V", 0, 1, BRIDGE), 0x7000_0010),
        (ArtMethod::new("b", "IJ", 0, 1, BRIDGE), 0x7000_0100),
        (ArtMethod::new("c", "L", 0, 2, BRIDGE), 0x7000_0400),
    ]
}

#[test]
fn children_see_published_entries() {
    let methods = zygote_methods();
    let mut map = ZygoteMap::new(8).unwrap();
    for (method, code) in &methods {
        map.put(method.key(), *code);
    }
    map.set_compilation_state(ZygoteCompilationState::Done);
    map.set_compilation_state(ZygoteCompilationState::NotifiedOk);

    let base = map.base();
    let status = run_in_child(|| {
        let Some(view) = (unsafe { ZygoteMapView::from_raw(base) }) else {
            return 1;
        };
        if view.compilation_state() != ZygoteCompilationState::NotifiedOk {
            return 2;
        }
        let Some(entries) = view.entries() else {
            return 3;
        };

        let mut seen = [false; 3];
        for (method, code) in entries {
            match methods.iter().position(|(m, c)| m.key() == method && *c == code) {
                Some(idx) if !seen[idx] => seen[idx] = true,
                _ => return 4,
            }
        }
        if seen != [true; 3] {
            return 5;
        }

        if unsafe { view.install_entry_points() } != 3 {
            return 6;
        }
        for (method, code) in &methods {
            if method.entry_point() != code + 1 {
                return 7;
            }
        }
        0
    });
    assert_eq!(status, 0);

    // The child patched its own copies of the methods.
    assert!(methods.iter().all(|(m, _)| m.entry_point() == BRIDGE));
    assert_eq!(map.compilation_state(), ZygoteCompilationState::NotifiedOk);
}

#[test]
fn children_ignore_failed_compilation() {
    let methods = zygote_methods();
    let mut map = ZygoteMap::new(8).unwrap();
    for (method, code) in &methods {
        map.put(method.key(), *code);
    }
    map.set_compilation_state(ZygoteCompilationState::Done);
    map.set_compilation_state(ZygoteCompilationState::NotifiedFailure);

    let view = map.view();
    let status = run_in_child(|| {
        if view.entries().is_some() || view.get_code_for(methods[0].0.key()).is_some() {
            return 1;
        }
        if unsafe { view.install_entry_points() } != 0 {
            return 2;
        }
        if methods.iter().any(|(m, _)| m.entry_point() != BRIDGE) {
            return 3;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn state_published_after_fork_is_visible() {
    let method = ArtMethod::new("late", "V", 0, 1, BRIDGE);
    let mut map = ZygoteMap::new(4).unwrap();
    map.put(method.key(), 0x7100_0000);

    // The child forks before validation and waits for the state to settle.
    let view = map.view();
    let mut pipe = [0; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
    let (read_end, write_end) = (pipe[0], pipe[1]);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        let mut byte = 0u8;
        let code = unsafe {
            libc::close(write_end);
            libc::read(read_end, &mut byte as *mut u8 as *mut libc::c_void, 1);
            if view.get_code_for(method.key()) == Some(0x7100_0000) { 0 } else { 1 }
        };
        unsafe { libc::_exit(code) };
    }

    map.set_compilation_state(ZygoteCompilationState::Done);
    map.set_compilation_state(ZygoteCompilationState::NotifiedOk);
    unsafe {
        libc::close(read_end);
        assert_eq!(libc::write(write_end, b"x".as_ptr() as *const libc::c_void, 1), 1);
        libc::close(write_end);

        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
