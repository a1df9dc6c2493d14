//! End-to-end scenarios driven entirely through the public API: a guest
//! export is a hand-written closure standing in for what a real compiled
//! WASM module would do, registered on [`witty_abi::testutil::FakeInstance`]
//! and invoked through the same [`Dispatcher`] a real engine embedding would
//! use.

use std::sync::{Arc, Mutex};

use witty_abi::allocator::Allocator;
use witty_abi::config::HostConfig;
use witty_abi::dispatch::Dispatcher;
use witty_abi::engine::{GuestPointer, HostFunctionRegistrar};
use witty_abi::flat::FlatValue;
use witty_abi::host_binder::{bind_string_string_to_string, bind_string_to_unit, ContextArity};
use witty_abi::testutil::{boxed_import, FakeInstance};
use witty_abi::wit_record;

fn dispatcher_and_allocator(instance: &FakeInstance) -> (Dispatcher<FakeInstance>, Allocator<FakeInstance>) {
    let dispatcher = Dispatcher::new(HostConfig::default());
    let allocator = Allocator::detect(instance, |_name| false).unwrap();
    (dispatcher, allocator)
}

#[test]
fn echo_list_s32_round_trips_byte_for_byte() {
    let mut instance = FakeInstance::new(256);
    instance.export("echo-list-s32", |env, args| {
        let in_ptr = GuestPointer(args[0].as_u32());
        let in_len = args[1].as_u32();
        let retptr = GuestPointer(args[2].as_u32());
        let out_ptr = if in_len == 0 {
            GuestPointer(0)
        } else {
            let bytes = env.read(in_ptr, in_len * 4)?;
            let ptr = env.alloc(in_len * 4, 4);
            env.write(ptr, &bytes)?;
            ptr
        };
        env.write(retptr, &out_ptr.0.to_le_bytes())?;
        env.write(retptr.advance(4), &in_len.to_le_bytes())?;
        Ok(vec![])
    });
    let (dispatcher, allocator) = dispatcher_and_allocator(&instance);

    for input in [vec![1, 2, 3, 4, 5], vec![], vec![i32::MIN, 0, i32::MAX]] {
        let result: Vec<i32> = dispatcher
            .call(&mut instance, &allocator, "echo-list-s32", input.clone())
            .unwrap();
        assert_eq!(result, input);
    }
}

#[test]
fn sum_list_widens_to_s64_without_overflow() {
    let mut instance = FakeInstance::new(256);
    instance.export("sum-list", |env, args| {
        let ptr = GuestPointer(args[0].as_u32());
        let len = args[1].as_u32();
        let mut sum: i64 = 0;
        for i in 0..len {
            let bytes = env.read(ptr.advance(i * 4), 4)?;
            sum += i32::from_le_bytes(bytes.try_into().unwrap()) as i64;
        }
        Ok(vec![FlatValue::I64(sum as u64)])
    });
    let (dispatcher, allocator) = dispatcher_and_allocator(&instance);

    let result: i64 = dispatcher
        .call(&mut instance, &allocator, "sum-list", vec![2147483647i32, 1])
        .unwrap();
    assert_eq!(result, 2147483648);
}

#[derive(Debug, PartialEq)]
struct ErrorInfo {
    code: u32,
    message: String,
}
wit_record!(ErrorInfo { code: u32, message: String });

#[test]
fn try_divide_reports_ok_and_err_arms() {
    let mut instance = FakeInstance::new(256);
    instance.export("try-divide", |env, args| {
        let a = args[0].as_i32();
        let b = args[1].as_i32();
        let retptr = GuestPointer(args[2].as_u32());
        if b == 0 {
            env.write(retptr, &1u8.to_le_bytes())?;
            env.write(retptr.advance(4), &1u32.to_le_bytes())?;
            let message = b"division by zero";
            let message_ptr = env.alloc(message.len() as u32, 1);
            env.write(message_ptr, message)?;
            env.write(retptr.advance(8), &message_ptr.0.to_le_bytes())?;
            env.write(retptr.advance(12), &(message.len() as u32).to_le_bytes())?;
        } else {
            env.write(retptr, &0u8.to_le_bytes())?;
            env.write(retptr.advance(4), &(a / b).to_le_bytes())?;
        }
        Ok(vec![])
    });
    let (dispatcher, allocator) = dispatcher_and_allocator(&instance);

    let ok: Result<i32, ErrorInfo> = dispatcher
        .call(&mut instance, &allocator, "try-divide", (10i32, 2i32))
        .unwrap();
    assert_eq!(ok, Ok(5));

    let err: Result<i32, ErrorInfo> = dispatcher
        .call(&mut instance, &allocator, "try-divide", (10i32, 0i32))
        .unwrap();
    match err {
        Err(info) => {
            assert_eq!(info.code, 1);
            assert_eq!(info.message, "division by zero");
        }
        Ok(_) => panic!("expected an err arm"),
    }
}

#[derive(Debug, PartialEq)]
struct Person {
    name: String,
    age: u32,
}
wit_record!(Person { name: String, age: u32 });

#[test]
fn echo_person_round_trips_unicode_strings() {
    let mut instance = FakeInstance::new(256);
    instance.export("echo-person", |env, args| {
        let name_ptr = GuestPointer(args[0].as_u32());
        let name_len = args[1].as_u32();
        let age = args[2].as_u32();
        let retptr = GuestPointer(args[3].as_u32());
        let out_ptr = if name_len == 0 {
            GuestPointer(0)
        } else {
            let bytes = env.read(name_ptr, name_len)?;
            let ptr = env.alloc(name_len, 1);
            env.write(ptr, &bytes)?;
            ptr
        };
        env.write(retptr, &out_ptr.0.to_le_bytes())?;
        env.write(retptr.advance(4), &name_len.to_le_bytes())?;
        env.write(retptr.advance(8), &age.to_le_bytes())?;
        Ok(vec![])
    });
    let (dispatcher, allocator) = dispatcher_and_allocator(&instance);

    for name in ["Alice", "Hello 世界 🎉"] {
        let person = Person {
            name: name.to_string(),
            age: 30,
        };
        let result: Person = dispatcher
            .call(&mut instance, &allocator, "echo-person", person)
            .unwrap();
        assert_eq!(result.name, name);
        assert_eq!(result.age, 30);
    }
}

#[test]
fn host_import_fast_path_is_reachable_during_a_guest_export() {
    let mut instance = FakeInstance::new(256);
    let log_calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_calls_for_closure = log_calls.clone();

    instance
        .register(
            "ns@0.1.0",
            "log",
            &[],
            &[],
            boxed_import(bind_string_to_unit(ContextArity(0), move |s| {
                log_calls_for_closure.lock().unwrap().push(s.to_string());
                Ok(())
            })),
        )
        .unwrap();
    instance
        .register(
            "ns@0.1.0",
            "concat",
            &[],
            &[],
            boxed_import(bind_string_string_to_string(ContextArity(0), |a, b| Ok(format!("{a}{b}")))),
        )
        .unwrap();

    instance.export("process", |env, args| {
        let in_ptr = GuestPointer(args[0].as_u32());
        let in_len = args[1].as_u32();
        let retptr = GuestPointer(args[2].as_u32());

        env.call_import("ns@0.1.0", "log", &[FlatValue::I32(in_ptr.0), FlatValue::I32(in_len)])?;

        let concat_args = [
            FlatValue::I32(in_ptr.0),
            FlatValue::I32(in_len),
            FlatValue::I32(in_ptr.0),
            FlatValue::I32(in_len),
        ];
        let concat_result = env.call_import("ns@0.1.0", "concat", &concat_args)?;
        let out_ptr = GuestPointer(concat_result[0].as_u32());
        let out_len = concat_result[1].as_u32();

        env.write(retptr, &out_ptr.0.to_le_bytes())?;
        env.write(retptr.advance(4), &out_len.to_le_bytes())?;
        Ok(vec![])
    });
    let (dispatcher, allocator) = dispatcher_and_allocator(&instance);

    let result: String = dispatcher
        .call(&mut instance, &allocator, "process", "test".to_string())
        .unwrap();

    assert!(result.contains("test"));
    let calls = log_calls.lock().unwrap();
    assert!(calls.iter().any(|s| s.contains("test")));
}
