use std::cell::Cell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use weft::{
    CHOICE_HAS_CHOICE_ONLY_TEXT, CHOICE_HAS_CONDITION, CHOICE_HAS_START_TEXT,
    CHOICE_INVISIBLE_DEFAULT, CHOICE_ONCE_ONLY, CONTAINER_RECORD_TURNS, CONTAINER_RECORD_VISITS,
    BinOp, Error, ExtValue, Op, ScopeHint, StackLimits, Story, StoryBuilder, gc, hash_name,
};

/// Push a literal string onto the evaluation stack.
fn push_text(b: &mut StoryBuilder, text: &str) {
    b.emit(Op::BeginEval);
    b.emit(Op::BeginStr);
    b.text(text);
    b.emit(Op::EndStr);
    b.emit(Op::EndEval);
}

fn single_choice_story() -> Story {
    let mut b = StoryBuilder::new();
    b.line("You stand at a door.");
    let open = b.new_label();
    push_text(&mut b, "X");
    b.choice(CHOICE_HAS_START_TEXT, open);
    b.emit(Op::Done);
    b.place(open);
    b.line("It opens.");
    b.emit(Op::End);
    b.story().unwrap()
}

// ---------------------------------------------------------------------------
// Plain text and glue
// ---------------------------------------------------------------------------

#[test]
fn plain_text_story() {
    let mut b = StoryBuilder::new();
    b.line("Hello, World!");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert!(runner.can_continue());
    assert_eq!(runner.getline().unwrap(), "Hello, World!");
    assert!(!runner.can_continue());
}

#[test]
fn empty_story_yields_nothing() {
    let mut b = StoryBuilder::new();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "");
    assert!(!runner.can_continue());
    assert!(!runner.has_choices());
}

#[test]
fn glue_joins_adjacent_text() {
    // "A <>\nB" reads back as a single "AB" line.
    let mut b = StoryBuilder::new();
    b.text("A ");
    b.glue();
    b.newline();
    b.line("B");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "AB");
    assert!(!runner.can_continue());
}

#[test]
fn glue_cancels_a_committed_newline() {
    // The newline lands first; glue on the following line retracts it.
    let mut b = StoryBuilder::new();
    b.line("A");
    b.glue();
    b.line("B");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "AB");
}

#[test]
fn getall_drains_every_line() {
    let mut b = StoryBuilder::new();
    b.line("one");
    b.line("two");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getall().unwrap(), "one\ntwo\n");
}

#[test]
fn numbers_render_into_lines() {
    let mut b = StoryBuilder::new();
    b.text("count: ");
    b.emit(Op::PushInt(42));
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "count: 42");
}

// ---------------------------------------------------------------------------
// Choices
// ---------------------------------------------------------------------------

#[test]
fn single_choice_flow() {
    let story = single_choice_story();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);

    assert_eq!(runner.getline().unwrap(), "You stand at a door.");
    assert!(!runner.can_continue());
    assert!(runner.has_choices());
    assert_eq!(runner.num_choices(), 1);
    assert_eq!(runner.get_choice(0).unwrap().text(), "X");

    runner.choose(0).unwrap();
    assert_eq!(runner.getline().unwrap(), "X");
    assert_eq!(runner.getline().unwrap(), "It opens.");
    assert!(!runner.can_continue());
}

#[test]
fn choose_out_of_range_leaves_state_unchanged() {
    let story = single_choice_story();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();

    let err = runner.choose(1).unwrap_err();
    assert!(matches!(
        err,
        Error::ChoiceOutOfRange { index: 1, count: 1 }
    ));
    assert!(!err.is_fatal());

    // Still choosable afterwards.
    assert!(runner.has_choices());
    runner.choose(0).unwrap();
    assert_eq!(runner.getline().unwrap(), "X");
}

#[test]
fn choice_only_text_is_shown_but_not_captured() {
    let mut b = StoryBuilder::new();
    b.line("A rope hangs here.");
    let take = b.new_label();
    push_text(&mut b, "Take the rope");
    push_text(&mut b, " (carefully)");
    b.choice(CHOICE_HAS_START_TEXT | CHOICE_HAS_CHOICE_ONLY_TEXT, take);
    b.emit(Op::Done);
    b.place(take);
    b.line("Yours now.");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();
    assert_eq!(
        runner.get_choice(0).unwrap().text(),
        "Take the rope (carefully)"
    );
    runner.choose(0).unwrap();
    assert_eq!(runner.getline().unwrap(), "Take the rope");
    assert_eq!(runner.getline().unwrap(), "Yours now.");
}

#[test]
fn false_condition_filters_the_choice() {
    let mut b = StoryBuilder::new();
    b.line("Nothing to do.");
    let hidden = b.new_label();
    b.emit(Op::PushBool(false));
    push_text(&mut b, "Hidden");
    b.choice(CHOICE_HAS_CONDITION | CHOICE_HAS_START_TEXT, hidden);
    b.emit(Op::Done);
    b.place(hidden);
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();
    assert!(!runner.has_choices());
    assert!(!runner.can_continue());
}

#[test]
fn once_only_choice_disappears_after_picking() {
    let mut b = StoryBuilder::new();
    let top = b.new_label();
    let pick = b.new_label();
    b.place(top);
    b.line("Offer:");
    push_text(&mut b, "X");
    b.choice(CHOICE_HAS_START_TEXT | CHOICE_ONCE_ONLY, pick);
    b.emit(Op::Done);
    b.place(pick);
    b.line("Picked.");
    b.divert(top, true);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Offer:");
    assert_eq!(runner.num_choices(), 1);

    runner.choose(0).unwrap();
    assert_eq!(runner.getall().unwrap(), "X\nPicked.\nOffer:\n");
    assert!(!runner.has_choices());
    assert!(!runner.can_continue());
}

#[test]
fn once_only_filtering_is_shared_through_globals() {
    let mut b = StoryBuilder::new();
    let pick = b.new_label();
    b.line("Offer:");
    push_text(&mut b, "X");
    b.choice(CHOICE_HAS_START_TEXT | CHOICE_ONCE_ONLY, pick);
    b.emit(Op::Done);
    b.place(pick);
    b.line("Picked.");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut first = story.new_runner(&globals);
    first.getline().unwrap();
    first.choose(0).unwrap();

    // A second runner sharing the same globals never sees the choice.
    let mut second = story.new_runner(&globals);
    second.getline().unwrap();
    assert!(!second.has_choices());
}

#[test]
fn lone_invisible_default_is_followed_automatically() {
    let mut b = StoryBuilder::new();
    let top = b.new_label();
    let go = b.new_label();
    let fallback = b.new_label();
    b.place(top);
    b.line("Wait.");
    push_text(&mut b, "Only");
    b.choice(CHOICE_HAS_START_TEXT | CHOICE_ONCE_ONLY, go);
    b.choice(CHOICE_INVISIBLE_DEFAULT, fallback);
    b.emit(Op::Done);
    b.place(go);
    b.line("Chosen.");
    b.divert(top, true);
    b.place(fallback);
    b.line("Nothing left.");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Wait.");
    assert_eq!(runner.num_choices(), 1);

    runner.choose(0).unwrap();
    assert_eq!(
        runner.getall().unwrap(),
        "Only\nChosen.\nWait.\nNothing left.\n"
    );
    assert!(!runner.can_continue());
}

// ---------------------------------------------------------------------------
// Variables, visits, and counters
// ---------------------------------------------------------------------------

#[test]
fn variable_write_and_visit_counts() {
    let x = hash_name("x");
    let mut b = StoryBuilder::new();
    b.emit(Op::PushInt(3));
    b.emit(Op::SetVar {
        name: x,
        redef: true,
    });
    let k = b.new_label();
    b.tunnel(k);
    b.tunnel(k);
    b.emit(Op::GetVar {
        name: x,
        hint: ScopeHint::None,
    });
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::End);
    b.place(k);
    let k_id = b.begin_container("k", CONTAINER_RECORD_VISITS);
    b.emit(Op::TunnelRet);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "3");
    assert_eq!(globals.borrow().visit_count(k_id), 2);
}

#[test]
fn set_without_redef_requires_an_existing_variable() {
    let mut b = StoryBuilder::new();
    b.emit(Op::PushInt(1));
    b.emit(Op::SetVar {
        name: hash_name("ghost"),
        redef: false,
    });
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    let err = runner.getline().unwrap_err();
    assert!(matches!(err, Error::UndefinedVariable(_)));
    assert!(err.is_fatal());
    assert!(matches!(runner.getline().unwrap_err(), Error::Dead));
}

#[test]
fn locals_shadow_globals_inside_a_function() {
    let x = hash_name("x");
    let mut b = StoryBuilder::new();
    b.emit(Op::PushInt(10));
    b.emit(Op::SetVar {
        name: x,
        redef: true,
    });
    let func = b.new_label();
    b.emit(Op::PushInt(7));
    b.call(func);
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::GetVar {
        name: x,
        hint: ScopeHint::None,
    });
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::End);
    b.place(func);
    b.emit(Op::DefLocal { name: x });
    b.emit(Op::GetVar {
        name: x,
        hint: ScopeHint::Local,
    });
    b.emit(Op::PushInt(2));
    b.emit(Op::Binary(BinOp::Mul));
    b.emit(Op::Ret);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    // The local x = 7 feeds the multiply; the global x = 10 is untouched.
    assert_eq!(runner.getline().unwrap(), "14");
    assert_eq!(runner.getline().unwrap(), "10");
}

#[test]
fn divert_to_self_loop_with_visit_guard_terminates() {
    let mut b = StoryBuilder::new();
    let top = b.new_label();
    b.place(top);
    let k_id = b.begin_container("loop", CONTAINER_RECORD_VISITS);
    b.emit(Op::Visits);
    b.emit(Op::PushInt(3));
    b.emit(Op::Binary(BinOp::Lt));
    b.divert_if(top);
    b.emit(Op::End);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "");
    assert!(!runner.can_continue());
    assert_eq!(globals.borrow().visit_count(k_id), 3);
}

#[test]
fn falling_through_a_container_records_one_visit() {
    let mut b = StoryBuilder::new();
    let k_id = b.begin_container("hall", CONTAINER_RECORD_VISITS);
    b.line("Inside the hall.");
    b.end_container();
    b.line("Outside again.");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Inside the hall.");
    assert_eq!(runner.getline().unwrap(), "Outside again.");
    assert_eq!(globals.borrow().visit_count(k_id), 1);
}

#[test]
fn non_recording_divert_skips_the_visit_count() {
    let mut b = StoryBuilder::new();
    let k = b.new_label();
    b.divert(k, false);
    b.place(k);
    let k_id = b.begin_container("quiet", CONTAINER_RECORD_VISITS);
    b.line("inside");
    b.emit(Op::End);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "inside");
    assert_eq!(globals.borrow().visit_count(k_id), 0);
}

#[test]
fn turns_since_tracks_choices_taken() {
    let mut b = StoryBuilder::new();
    let k = b.new_label();
    let again = b.new_label();
    b.divert(k, true);
    b.place(k);
    let enter_at = b.here();
    b.begin_container("k", CONTAINER_RECORD_VISITS | CONTAINER_RECORD_TURNS);
    b.line("At k.");
    push_text(&mut b, "Go");
    b.choice(CHOICE_HAS_START_TEXT, again);
    b.emit(Op::Done);
    b.end_container();
    b.place(again);
    // TURNS_SINCE takes the knot as a divert value.
    b.emit(Op::PushDivert(enter_at));
    b.emit(Op::TurnsSince);
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "At k.");
    runner.choose(0).unwrap();
    // One turn has passed since k was visited.
    assert_eq!(runner.getall().unwrap(), "Go\n1\n");
}

#[test]
fn sequence_indices_cover_a_full_cycle() {
    let mut b = StoryBuilder::new();
    let top = b.new_label();
    b.place(top);
    b.begin_container("seq", CONTAINER_RECORD_VISITS);
    b.emit(Op::Seq { count: 3, seed: 11 });
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::Visits);
    b.emit(Op::PushInt(3));
    b.emit(Op::Binary(BinOp::Lt));
    b.divert_if(top);
    b.emit(Op::End);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    let mut seen: Vec<i32> = Vec::new();
    while runner.can_continue() {
        let line = runner.getline().unwrap();
        if !line.is_empty() {
            seen.push(line.parse().unwrap());
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Functions, tunnels, threads
// ---------------------------------------------------------------------------

#[test]
fn value_function_leaves_no_output_residue() {
    let mut b = StoryBuilder::new();
    let double = b.new_label();
    b.emit(Op::PushInt(7));
    b.call(double);
    b.emit(Op::Out);
    b.newline();
    b.emit(Op::End);
    b.place(double);
    b.emit(Op::DefLocal {
        name: hash_name("n"),
    });
    b.emit(Op::GetVar {
        name: hash_name("n"),
        hint: ScopeHint::Local,
    });
    b.emit(Op::PushInt(2));
    b.emit(Op::Binary(BinOp::Mul));
    b.emit(Op::Ret);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "14");
}

#[test]
fn printing_function_contributes_to_the_line() {
    let mut b = StoryBuilder::new();
    let f = b.new_label();
    b.text("Say: ");
    b.call(f);
    b.newline();
    b.emit(Op::End);
    b.place(f);
    b.text("hi");
    b.emit(Op::Ret);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Say: hi");
}

#[test]
fn speculative_function_side_effects_run_exactly_once() {
    let counter = hash_name("counter");
    let mut b = StoryBuilder::new();
    let f = b.new_label();
    b.emit(Op::PushInt(0));
    b.emit(Op::SetVar {
        name: counter,
        redef: true,
    });
    b.line("one");
    // The call sits after a line boundary, so it first runs speculatively
    // and is rolled back when its text extends past the newline.
    b.call(f);
    b.newline();
    b.emit(Op::End);
    b.place(f);
    b.emit(Op::GetVar {
        name: counter,
        hint: ScopeHint::None,
    });
    b.emit(Op::PushInt(1));
    b.emit(Op::Binary(BinOp::Add));
    b.emit(Op::SetVar {
        name: counter,
        redef: false,
    });
    b.text("two");
    b.emit(Op::Ret);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "one");
    assert_eq!(runner.getline().unwrap(), "two");
    assert_eq!(
        globals.borrow().get_var(counter),
        Some(weft::Value::Int(1))
    );
}

#[test]
fn mismatched_return_is_fatal() {
    let mut b = StoryBuilder::new();
    let f = b.new_label();
    b.call(f);
    b.emit(Op::End);
    b.place(f);
    b.emit(Op::TunnelRet); // returning from a function frame as a tunnel
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    let err = runner.getline().unwrap_err();
    assert!(matches!(err, Error::FrameMismatch { .. }));
    assert!(err.is_fatal());
    assert!(!runner.can_continue());
}

#[test]
fn threads_collect_choices_in_fork_order() {
    let mut b = StoryBuilder::new();
    let t1 = b.new_label();
    let t2 = b.new_label();
    let left = b.new_label();
    let right = b.new_label();
    b.line("Crossroads.");
    b.thread(t1);
    b.thread(t2);
    b.emit(Op::Done);
    b.place(t1);
    push_text(&mut b, "Left");
    b.choice(CHOICE_HAS_START_TEXT, left);
    b.emit(Op::Done);
    b.place(t2);
    push_text(&mut b, "Right");
    b.choice(CHOICE_HAS_START_TEXT, right);
    b.emit(Op::Done);
    b.place(left);
    b.line("You go left.");
    b.emit(Op::End);
    b.place(right);
    b.line("You go right.");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Crossroads.");

    let texts: Vec<&str> = runner.choices().map(|c| c.text()).collect();
    assert_eq!(texts, vec!["Left", "Right"]);

    // Each fork carries its own id.
    let threads: Vec<_> = runner.choices().map(|c| c.thread()).collect();
    assert_eq!(threads.len(), 2);
    assert_ne!(threads[0], threads[1]);

    runner.choose(1).unwrap();
    assert_eq!(runner.getall().unwrap(), "Right\nYou go right.\n");
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[test]
fn tags_split_into_global_and_line_level() {
    let mut b = StoryBuilder::new();
    b.emit(Op::BeginTag);
    b.text("title: Weft");
    b.emit(Op::EndTag);
    b.text("Text.");
    b.emit(Op::BeginTag);
    b.text("mood: dark");
    b.emit(Op::EndTag);
    b.newline();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "Text.");

    assert_eq!(runner.num_global_tags(), 1);
    assert_eq!(runner.get_global_tag(0), Some("title: Weft"));
    assert!(runner.has_tags());
    assert_eq!(runner.num_tags(), 1);
    assert_eq!(runner.get_tag(0), Some("mood: dark"));
}

#[test]
fn line_tags_clear_on_the_next_line() {
    let mut b = StoryBuilder::new();
    b.text("one");
    b.emit(Op::BeginTag);
    b.text("first");
    b.emit(Op::EndTag);
    b.newline();
    b.line("two");
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();
    assert_eq!(runner.get_tag(0), Some("first"));
    runner.getline().unwrap();
    assert_eq!(runner.num_tags(), 0);
}

// ---------------------------------------------------------------------------
// move_to
// ---------------------------------------------------------------------------

#[test]
fn move_to_jumps_to_a_named_container() {
    let mut b = StoryBuilder::new();
    b.line("start");
    b.emit(Op::End);
    b.begin_container("kitchen", 0);
    b.line("The kitchen is warm.");
    b.emit(Op::End);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "start");
    assert!(!runner.can_continue());

    assert!(runner.move_to(hash_name("kitchen")));
    assert!(runner.can_continue());
    assert_eq!(runner.getline().unwrap(), "The kitchen is warm.");
}

#[test]
fn move_to_unknown_path_is_a_no_op() {
    let story = single_choice_story();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();

    assert!(!runner.move_to(hash_name("nowhere")));
    // The pending choice list is untouched by the failed move.
    assert!(runner.has_choices());
}

#[test]
fn move_to_clears_pending_choices() {
    let mut b = StoryBuilder::new();
    b.line("You stand at a door.");
    let open = b.new_label();
    push_text(&mut b, "X");
    b.choice(CHOICE_HAS_START_TEXT, open);
    b.emit(Op::Done);
    b.place(open);
    b.emit(Op::End);
    b.begin_container("elsewhere", 0);
    b.line("Elsewhere.");
    b.emit(Op::End);
    b.end_container();
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();
    assert!(runner.has_choices());

    assert!(runner.move_to(hash_name("elsewhere")));
    assert!(!runner.has_choices());
    assert_eq!(runner.getline().unwrap(), "Elsewhere.");
}

// ---------------------------------------------------------------------------
// External functions
// ---------------------------------------------------------------------------

#[test]
fn external_function_receives_args_and_returns_text() {
    let mut b = StoryBuilder::new();
    push_text(&mut b, "Alice");
    b.emit(Op::CallExternal {
        name: hash_name("greet"),
        args: 1,
    });
    b.newline();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.bind_external(hash_name("greet"), true, |args| {
        let name = match args.first() {
            Some(ExtValue::Str(s)) => s.as_str(),
            _ => "nobody",
        };
        ExtValue::Str(format!("Hello, {name}!"))
    });
    assert_eq!(runner.getline().unwrap(), "Hello, Alice!");
}

#[test]
fn unbound_external_is_fatal() {
    let mut b = StoryBuilder::new();
    b.emit(Op::CallExternal {
        name: hash_name("missing"),
        args: 0,
    });
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    let err = runner.getline().unwrap_err();
    assert!(matches!(err, Error::ExternalNotBound(_)));
    assert!(err.is_fatal());
}

#[test]
fn unsafe_external_is_never_called_during_lookahead() {
    let mut b = StoryBuilder::new();
    b.line("A");
    b.emit(Op::CallExternal {
        name: hash_name("ding"),
        args: 0,
    });
    b.newline();
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    runner.bind_external(hash_name("ding"), false, move |_| {
        seen.set(seen.get() + 1);
        ExtValue::Str("DING".into())
    });

    // The call sits right after the line boundary: look-ahead must stop
    // short of it.
    assert_eq!(runner.getline().unwrap(), "A");
    assert_eq!(calls.get(), 0);

    // Committed execution runs it exactly once.
    assert_eq!(runner.getline().unwrap(), "DING");
    assert_eq!(calls.get(), 1);
}

// ---------------------------------------------------------------------------
// Errors and limits
// ---------------------------------------------------------------------------

#[test]
fn division_by_zero_kills_the_runner() {
    let mut b = StoryBuilder::new();
    b.emit(Op::PushInt(1));
    b.emit(Op::PushInt(0));
    b.emit(Op::Binary(BinOp::Div));
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert!(matches!(
        runner.getline().unwrap_err(),
        Error::DivisionByZero
    ));
    assert!(matches!(runner.getline().unwrap_err(), Error::Dead));
    assert!(!runner.can_continue());
}

#[test]
fn speculative_errors_are_contained() {
    let mut b = StoryBuilder::new();
    b.line("safe");
    b.emit(Op::PushInt(1));
    b.emit(Op::PushInt(0));
    b.emit(Op::Binary(BinOp::Div));
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);

    // The fault happens during look-ahead past "safe": the runner rewinds
    // to the committed boundary and survives.
    assert!(matches!(
        runner.getline().unwrap_err(),
        Error::DivisionByZero
    ));
    assert!(runner.can_continue());
    assert_eq!(runner.getline().unwrap(), "safe");

    // Re-executing the fault outside speculation is fatal.
    assert!(matches!(
        runner.getline().unwrap_err(),
        Error::DivisionByZero
    ));
    assert!(matches!(runner.getline().unwrap_err(), Error::Dead));
}

#[test]
fn fixed_capacity_overflow_is_fatal() {
    let mut b = StoryBuilder::new();
    b.emit(Op::PushInt(1));
    b.emit(Op::PushInt(2));
    b.emit(Op::PushInt(3));
    b.emit(Op::End);
    let story = b.story().unwrap();

    let globals = story.new_globals();
    let mut runner = story.new_runner_with_limits(
        &globals,
        StackLimits {
            eval: Some(2),
            ..Default::default()
        },
    );
    assert!(matches!(
        runner.getline().unwrap_err(),
        Error::CapacityExceeded("evaluation stack", 2)
    ));
    assert!(matches!(runner.getline().unwrap_err(), Error::Dead));
}

// ---------------------------------------------------------------------------
// Garbage collection
// ---------------------------------------------------------------------------

#[test]
fn gc_between_lines_preserves_reachable_state() {
    let story = single_choice_story();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    runner.getline().unwrap();

    gc(&globals, &[&runner]);
    runner.choose(0).unwrap();
    gc(&globals, &[&runner]);

    // The echoed choice text lives in the string table and must have
    // survived both sweeps.
    assert_eq!(runner.getline().unwrap(), "X");
    assert_eq!(runner.getline().unwrap(), "It opens.");
}

// ---------------------------------------------------------------------------
// Story loading
// ---------------------------------------------------------------------------

#[test]
fn story_round_trips_through_a_file() {
    let mut b = StoryBuilder::new();
    b.line("From disk.");
    b.emit(Op::End);
    let bytes = b.build().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("story.weft");
    std::fs::write(&path, &bytes).unwrap();

    let story = Story::from_file(&path).unwrap();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    assert_eq!(runner.getline().unwrap(), "From disk.");
}

#[test]
fn corrupt_story_images_are_rejected() {
    assert!(matches!(
        Story::from_bytes(b"not a story"),
        Err(Error::BadImage(_)) | Err(Error::UnexpectedEof)
    ));

    let mut b = StoryBuilder::new();
    b.line("x");
    b.emit(Op::End);
    let bytes = b.build().unwrap();
    assert!(matches!(
        Story::from_bytes(&bytes[..bytes.len() - 2]),
        Err(Error::UnexpectedEof)
    ));
}
